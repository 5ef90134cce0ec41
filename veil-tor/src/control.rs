//! Minimal Tor control-port client (AUTHENTICATE + SIGNAL NEWNYM)

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;

use crate::TorError;

/// Quote a control-port string argument
fn quote(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{}\"", escaped)
}

/// Send one command and require a `250` reply
async fn command(
    reader: &mut BufReader<TcpStream>,
    line: &str,
    label: &str,
) -> Result<(), TorError> {
    reader.get_mut().write_all(format!("{}\r\n", line).as_bytes()).await?;

    let mut reply = String::new();
    loop {
        reply.clear();
        if reader.read_line(&mut reply).await? == 0 {
            return Err(TorError::ControlRejected {
                command: label.to_string(),
                reply: "connection closed".to_string(),
            });
        }
        // Multi-line replies use "250-" / "250+" until the final "250 "
        if reply.len() < 4 || reply.as_bytes()[3] == b' ' {
            break;
        }
    }

    if reply.starts_with("250") {
        Ok(())
    } else {
        Err(TorError::ControlRejected {
            command: label.to_string(),
            reply: reply.trim().to_string(),
        })
    }
}

/// Authenticate to the control port and request a new identity
pub async fn signal_newnym(addr: &str, password: Option<&str>) -> Result<(), TorError> {
    let stream = TcpStream::connect(addr).await?;
    let mut reader = BufReader::new(stream);

    let auth = match password {
        Some(pw) => format!("AUTHENTICATE {}", quote(pw)),
        None => "AUTHENTICATE".to_string(),
    };
    command(&mut reader, &auth, "AUTHENTICATE").await?;
    command(&mut reader, "SIGNAL NEWNYM", "SIGNAL NEWNYM").await?;

    debug!("NEWNYM accepted by {}", addr);
    let _ = reader.get_mut().write_all(b"QUIT\r\n").await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Fake control port answering each line with the next canned reply
    async fn fake_control(replies: Vec<&'static str>) -> (String, tokio::task::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let handle = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut reader = BufReader::new(stream);
            let mut received = Vec::new();
            for reply in replies {
                let mut line = String::new();
                if reader.read_line(&mut line).await.unwrap() == 0 {
                    break;
                }
                received.push(line.trim().to_string());
                reader.get_mut().write_all(reply.as_bytes()).await.unwrap();
            }
            received
        });

        (addr, handle)
    }

    #[test]
    fn test_quote() {
        assert_eq!(quote(r#"pa"ss\w"#), r#""pa\"ss\\w""#);
    }

    #[tokio::test]
    async fn test_newnym_with_password() {
        let (addr, handle) = fake_control(vec!["250 OK\r\n", "250 OK\r\n"]).await;

        signal_newnym(&addr, Some("secret")).await.unwrap();

        let received = handle.await.unwrap();
        assert_eq!(received, vec!["AUTHENTICATE \"secret\"", "SIGNAL NEWNYM"]);
    }

    #[tokio::test]
    async fn test_bad_password_is_rejected() {
        let (addr, _handle) =
            fake_control(vec!["515 Authentication failed: Password did not match\r\n"]).await;

        let err = signal_newnym(&addr, Some("wrong")).await.unwrap_err();
        assert!(matches!(err, TorError::ControlRejected { .. }));
    }
}
