use std::{collections::HashMap, net::SocketAddr, path::PathBuf, sync::Arc};

use poem::{
    get, handler,
    http::StatusCode,
    listener::TcpListener,
    web::{Data, Path},
    EndpointExt, IntoResponse, Response, Route, Server,
};

const PAC_CONTENT_TYPE: &str = "application/x-ns-proxy-autoconfig";

/// Static documents (usually PAC files) served at `{base_path}/{file name}`.
#[derive(Debug, Clone)]
pub struct DocumentServerConfig {
    pub listen_addr: SocketAddr,
    pub base_path: String,
    pub files: Vec<PathBuf>,
}

/// Leading slash, no trailing slash. The root path becomes empty.
pub fn normalize_base_path(base: &str) -> String {
    let trimmed = base.trim_end_matches('/');
    if trimmed.is_empty() {
        return String::new();
    }
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

type DocumentSet = Arc<HashMap<String, PathBuf>>;

fn document_set(files: &[PathBuf]) -> DocumentSet {
    let mut docs = HashMap::new();
    for path in files {
        match path.file_name().and_then(|name| name.to_str()) {
            Some(name) => {
                docs.insert(name.to_string(), path.clone());
            }
            None => log::warn!("[DocumentServer] skip {} without file name", path.display()),
        }
    }
    Arc::new(docs)
}

#[handler]
async fn serve_document(Path(name): Path<String>, docs: Data<&DocumentSet>) -> Response {
    let Some(path) = docs.get(&name) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    match tokio::fs::read(path).await {
        Ok(body) => Response::builder().content_type(PAC_CONTENT_TYPE).body(body),
        Err(e) => {
            log::warn!("[DocumentServer] read {} error {e}", path.display());
            StatusCode::NOT_FOUND.into_response()
        }
    }
}

pub fn build_route(cfg: &DocumentServerConfig) -> impl poem::Endpoint {
    let base = normalize_base_path(&cfg.base_path);
    let docs = document_set(&cfg.files);
    for name in docs.keys() {
        log::info!("[DocumentServer] serving {name} at http://{}{base}/{name}", cfg.listen_addr);
    }
    Route::new().at(format!("{base}/:name"), get(serve_document)).data(docs)
}

/// Serve until the listener fails. Returns immediately when no file is configured.
pub async fn run_document_server(cfg: DocumentServerConfig) -> anyhow::Result<()> {
    if cfg.files.is_empty() {
        return Ok(());
    }
    let app = build_route(&cfg);
    Server::new(TcpListener::bind(cfg.listen_addr)).name("ssh-tunnel-docs").run(app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use poem::{http::StatusCode, test::TestClient};
    use test_log::test;

    use super::{build_route, normalize_base_path, DocumentServerConfig};

    #[test]
    fn base_path_normalization() {
        assert_eq!(normalize_base_path("/pac"), "/pac");
        assert_eq!(normalize_base_path("pac/"), "/pac");
        assert_eq!(normalize_base_path("/a/b//"), "/a/b");
        assert_eq!(normalize_base_path("/"), "");
    }

    #[test(tokio::test)]
    async fn serves_configured_file_only() {
        let dir = std::env::temp_dir().join(format!("ssh-tunnel-docs-{:016x}", rand::random::<u64>()));
        std::fs::create_dir_all(&dir).expect("should create dir");
        let file = dir.join("proxy.pac");
        std::fs::write(&file, "function FindProxyForURL(url, host) { return \"DIRECT\"; }").expect("should write");

        let cfg = DocumentServerConfig {
            listen_addr: "127.0.0.1:0".parse().expect("should parse"),
            base_path: "pac".to_string(),
            files: vec![file, PathBuf::from("/nonexistent/missing.pac")],
        };
        let client = TestClient::new(build_route(&cfg));

        let resp = client.get("/pac/proxy.pac").send().await;
        resp.assert_status_is_ok();
        resp.assert_content_type("application/x-ns-proxy-autoconfig");
        resp.assert_text("function FindProxyForURL(url, host) { return \"DIRECT\"; }").await;

        client.get("/pac/other.pac").send().await.assert_status(StatusCode::NOT_FOUND);
        client.get("/pac/missing.pac").send().await.assert_status(StatusCode::NOT_FOUND);
        client.get("/proxy.pac").send().await.assert_status(StatusCode::NOT_FOUND);
    }
}
