use std::{
    collections::HashMap,
    sync::{Mutex, OnceLock},
    time::Duration,
};

use gsm_process::{OperationId, ProgressSnapshot, ProvisionStage};

use crate::support::now_unix_ms;

fn store() -> &'static Mutex<HashMap<String, ProgressSnapshot>> {
    static STORE: OnceLock<Mutex<HashMap<String, ProgressSnapshot>>> = OnceLock::new();
    STORE.get_or_init(|| Mutex::new(HashMap::new()))
}

fn cleanup_locked(map: &mut HashMap<String, ProgressSnapshot>) {
    let now = now_unix_ms();
    let stale_done_ms = Duration::from_secs(10 * 60).as_millis() as u64;
    let stale_any_ms = Duration::from_secs(60 * 60).as_millis() as u64;

    map.retain(|_, snap| {
        let age = now.saturating_sub(snap.updated_at_unix_ms);
        if snap.done {
            return age <= stale_done_ms;
        }
        age <= stale_any_ms
    });
}

pub fn start(op: &OperationId, stage: ProvisionStage, message: impl Into<String>) {
    let mut map = store().lock().unwrap_or_else(|e| e.into_inner());
    cleanup_locked(&mut map);
    map.insert(
        op.0.clone(),
        ProgressSnapshot {
            stage,
            downloaded_bytes: 0,
            total_bytes: 0,
            speed_bytes_per_sec: 0,
            message: message.into(),
            done: stage.is_terminal(),
            updated_at_unix_ms: now_unix_ms(),
        },
    );
}

#[derive(Debug, Clone, Default)]
pub struct UpdateArgs {
    pub stage: Option<ProvisionStage>,
    pub downloaded_bytes: Option<u64>,
    pub total_bytes: Option<u64>,
    pub speed_bytes_per_sec: Option<u64>,
    pub message: Option<String>,
}

pub fn update(op: &OperationId, args: UpdateArgs) {
    let mut map = store().lock().unwrap_or_else(|e| e.into_inner());
    cleanup_locked(&mut map);

    let now = now_unix_ms();
    let snap = map.entry(op.0.clone()).or_insert_with(|| ProgressSnapshot {
        stage: ProvisionStage::Installed,
        downloaded_bytes: 0,
        total_bytes: 0,
        speed_bytes_per_sec: 0,
        message: String::new(),
        done: false,
        updated_at_unix_ms: now,
    });

    if let Some(stage) = args.stage {
        snap.stage = stage;
        snap.done = stage.is_terminal();
        if snap.done {
            snap.speed_bytes_per_sec = 0;
        }
    }
    if let Some(downloaded) = args.downloaded_bytes {
        snap.downloaded_bytes = downloaded;
    }
    if let Some(total) = args.total_bytes {
        snap.total_bytes = total;
    }
    if let Some(speed) = args.speed_bytes_per_sec {
        snap.speed_bytes_per_sec = speed;
    }
    if let Some(message) = args.message {
        snap.message = message;
    }
    snap.updated_at_unix_ms = now;
}

pub fn stage(op: &OperationId, stage: ProvisionStage, message: impl Into<String>) {
    update(
        op,
        UpdateArgs {
            stage: Some(stage),
            message: Some(message.into()),
            ..UpdateArgs::default()
        },
    );
}

pub fn finish(op: &OperationId, stage: ProvisionStage, message: impl Into<String>) {
    debug_assert!(stage.is_terminal());
    self::stage(op, stage, message);
}

pub fn fail(op: &OperationId, message: impl Into<String>) {
    self::stage(op, ProvisionStage::Failed, message);
}

pub fn get(op: &OperationId) -> Option<ProgressSnapshot> {
    let mut map = store().lock().unwrap_or_else(|e| e.into_inner());
    cleanup_locked(&mut map);
    map.get(&op.0).cloned()
}
