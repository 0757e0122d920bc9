#![allow(dead_code)]

use std::{
    collections::HashMap,
    io::Write,
    path::Path,
    sync::{Arc, Mutex},
};

use gsm_agent::{InstanceConfig, NullSink, ReleaseSource, SampServer};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpListener,
};

#[derive(Clone)]
struct Route {
    status: u16,
    content_type: &'static str,
    body: Arc<Vec<u8>>,
}

/// Minimal HTTP/1.1 server on a loopback port. One request per connection.
pub struct Fixture {
    pub base: String,
    routes: Arc<Mutex<HashMap<String, Route>>>,
    hits: Arc<Mutex<HashMap<String, usize>>>,
}

impl Fixture {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let routes: Arc<Mutex<HashMap<String, Route>>> = Arc::default();
        let hits: Arc<Mutex<HashMap<String, usize>>> = Arc::default();

        let (r, h) = (routes.clone(), hits.clone());
        tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else {
                    break;
                };
                let (routes, hits) = (r.clone(), h.clone());
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    let mut chunk = [0u8; 1024];
                    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                        match sock.read(&mut chunk).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => buf.extend_from_slice(&chunk[..n]),
                        }
                    }
                    let head = String::from_utf8_lossy(&buf).to_string();
                    let path = head
                        .split_whitespace()
                        .nth(1)
                        .unwrap_or("/")
                        .split('?')
                        .next()
                        .unwrap_or("/")
                        .to_string();
                    *hits.lock().unwrap().entry(path.clone()).or_default() += 1;

                    let route = routes.lock().unwrap().get(&path).cloned();
                    let route = route.unwrap_or(Route {
                        status: 404,
                        content_type: "text/plain",
                        body: Arc::new(b"not found".to_vec()),
                    });
                    let reason = if route.status == 200 { "OK" } else { "Error" };
                    let header = format!(
                        "HTTP/1.1 {} {reason}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                        route.status,
                        route.content_type,
                        route.body.len()
                    );
                    let _ = sock.write_all(header.as_bytes()).await;
                    let _ = sock.write_all(&route.body).await;
                    let _ = sock.shutdown().await;
                });
            }
        });

        Self {
            base: format!("http://{addr}"),
            routes,
            hits,
        }
    }

    fn set(&self, path: &str, status: u16, content_type: &'static str, body: Vec<u8>) {
        self.routes.lock().unwrap().insert(
            path.to_string(),
            Route {
                status,
                content_type,
                body: Arc::new(body),
            },
        );
    }

    pub fn page(&self, path: &str, html: &str) {
        self.set(path, 200, "text/html", html.as_bytes().to_vec());
    }

    pub fn file(&self, path: &str, body: Vec<u8>) {
        self.set(path, 200, "application/zip", body);
    }

    pub fn fail(&self, path: &str, status: u16) {
        self.set(path, status, "text/plain", b"upstream error".to_vec());
    }

    pub fn hits(&self, path: &str) -> usize {
        self.hits.lock().unwrap().get(path).copied().unwrap_or(0)
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    pub fn source(&self) -> ReleaseSource {
        ReleaseSource {
            download_page_url: self.url("/create-server/"),
            builds_page_url: self.url("/downloads/"),
            ..ReleaseSource::default()
        }
    }
}

pub fn link_page(href: &str) -> String {
    format!(
        r#"<html><body>
<a href="https://example.invalid/sa-mp-0.3.7-install.exe">Client</a>
<a class="download" href="{href}">Windows server</a>
</body></html>"#
    )
}

pub fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut zip = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let opts = zip::write::SimpleFileOptions::default();
    for (name, data) in entries {
        zip.start_file(*name, opts).unwrap();
        zip.write_all(data).unwrap();
    }
    zip.finish().unwrap().into_inner()
}

pub fn server(dir: &Path, source: ReleaseSource) -> SampServer {
    let mut cfg = InstanceConfig::new("it");
    cfg.install_dir = Some(dir.to_path_buf());
    cfg.rcon_password = "hunter2".to_string();
    SampServer::with_source(cfg, source, Arc::new(NullSink)).unwrap()
}
