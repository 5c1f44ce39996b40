//! Minimal HTTP server for provider tests.

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// Build a raw HTTP/1.1 response carrying a JSON body.
pub(crate) fn json_response(status: u16, body: &str) -> String {
    format!(
        "HTTP/1.1 {status} OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    )
}

/// Spawn a server that answers one connection per entry in `responses`, in order.
///
/// Returns the bound port and a handle resolving to the captured request bodies.
pub(crate) async fn spawn_mock_server(responses: Vec<String>) -> (u16, JoinHandle<Vec<String>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let handle = tokio::spawn(async move {
        let mut bodies = Vec::new();
        for resp in responses {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            let (reader, mut writer) = stream.split();
            let mut buf_reader = BufReader::new(reader);
            let mut content_length = 0usize;
            let mut line = String::new();
            loop {
                line.clear();
                if buf_reader.read_line(&mut line).await.unwrap_or(0) == 0 {
                    break;
                }
                if line == "\r\n" || line == "\n" {
                    break;
                }
                if let Some((name, value)) = line.split_once(':')
                    && name.eq_ignore_ascii_case("content-length")
                {
                    content_length = value.trim().parse().unwrap_or(0);
                }
            }
            let mut body = vec![0u8; content_length];
            buf_reader.read_exact(&mut body).await.ok();
            bodies.push(String::from_utf8_lossy(&body).into_owned());

            writer.write_all(resp.as_bytes()).await.ok();
            writer.shutdown().await.ok();
        }
        bodies
    });

    (port, handle)
}
