//! Single NNTP connection: handshake, AUTHINFO, BODY.
//!
//! The connection is generic over the stream so tests can drive it with an
//! in-memory duplex instead of a TCP socket.

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;

use super::NntpError;
use crate::config::ProviderConfig;

struct Response {
    code: u16,
    line: String,
}

pub(crate) struct NntpConnection<S = TcpStream> {
    stream: BufStream<S>,
    host: String,
}

impl NntpConnection<TcpStream> {
    /// Connect and authenticate against one provider.
    pub(crate) async fn connect(provider: &ProviderConfig) -> Result<Self, NntpError> {
        let stream = TcpStream::connect((provider.host.as_str(), provider.port)).await?;
        let mut conn = Self::from_stream(stream, &provider.host);

        let greeting = conn.read_response().await?;
        if !matches!(greeting.code, 200 | 201) {
            return Err(NntpError::Protocol(format!(
                "unexpected greeting from {}: {}",
                conn.host, greeting.line
            )));
        }

        if let Some(user) = &provider.username {
            conn.authenticate(user, provider.password.as_deref().unwrap_or(""))
                .await?;
        }

        Ok(conn)
    }
}

impl<S: AsyncRead + AsyncWrite + Send + Unpin> NntpConnection<S> {
    pub(crate) fn from_stream(stream: S, host: &str) -> Self {
        Self {
            stream: BufStream::new(stream),
            host: host.to_string(),
        }
    }

    async fn authenticate(&mut self, user: &str, password: &str) -> Result<(), NntpError> {
        let reply = self.command(&format!("AUTHINFO USER {user}")).await?;
        match reply.code {
            281 => return Ok(()),
            381 => {}
            _ => {
                return Err(NntpError::AuthRejected {
                    host: self.host.clone(),
                    reply: reply.line,
                })
            }
        }

        let reply = self.command(&format!("AUTHINFO PASS {password}")).await?;
        if reply.code != 281 {
            return Err(NntpError::AuthRejected {
                host: self.host.clone(),
                reply: reply.line,
            });
        }
        Ok(())
    }

    /// Fetch one article body into `sink`, returning the byte count.
    pub(crate) async fn body(
        &mut self,
        message_id: &str,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
        groups: &[String],
    ) -> Result<u64, NntpError> {
        let id = bracketed(message_id);
        let mut reply = self.command(&format!("BODY {id}")).await?;

        if is_missing(reply.code) && !groups.is_empty() {
            // Some servers only resolve message-ids inside a selected group.
            for group in groups {
                let switched = self.command(&format!("GROUP {group}")).await?;
                if switched.code != 211 {
                    continue;
                }
                reply = self.command(&format!("BODY {id}")).await?;
                if reply.code == 222 {
                    break;
                }
            }
        }

        match reply.code {
            222 => self.read_body(sink).await,
            code if is_missing(code) => Err(NntpError::ArticleMissing(message_id.to_string())),
            _ => Err(NntpError::Protocol(format!(
                "BODY {id} rejected by {}: {}",
                self.host, reply.line
            ))),
        }
    }

    /// Read a dot-terminated body, unstuffing leading double dots.
    async fn read_body(
        &mut self,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<u64, NntpError> {
        let mut transferred = 0u64;
        let mut line = Vec::new();
        loop {
            line.clear();
            let read = self.stream.read_until(b'\n', &mut line).await?;
            if read == 0 {
                return Err(NntpError::Protocol(format!(
                    "{} closed the connection mid-body",
                    self.host
                )));
            }
            trim_crlf(&mut line);
            if line.as_slice() == b"." {
                break;
            }
            let payload: &[u8] = if line.starts_with(b"..") {
                &line[1..]
            } else {
                &line
            };
            sink.write_all(payload).await?;
            sink.write_all(b"\r\n").await?;
            transferred += payload.len() as u64 + 2;
        }
        Ok(transferred)
    }

    async fn command(&mut self, cmd: &str) -> Result<Response, NntpError> {
        self.stream.write_all(cmd.as_bytes()).await?;
        self.stream.write_all(b"\r\n").await?;
        self.stream.flush().await?;
        self.read_response().await
    }

    async fn read_response(&mut self) -> Result<Response, NntpError> {
        let mut line = Vec::new();
        let read = self.stream.read_until(b'\n', &mut line).await?;
        if read == 0 {
            return Err(NntpError::Protocol(format!(
                "connection to {} closed",
                self.host
            )));
        }
        trim_crlf(&mut line);
        let text = String::from_utf8_lossy(&line).into_owned();
        let code = text
            .get(..3)
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| {
                NntpError::Protocol(format!("malformed reply from {}: {text}", self.host))
            })?;
        Ok(Response { code, line: text })
    }

    /// Politely close the connection. Errors are ignored, the socket is
    /// going away either way.
    pub(crate) async fn quit(mut self) {
        let _ = self.stream.write_all(b"QUIT\r\n").await;
        let _ = self.stream.flush().await;
    }
}

fn is_missing(code: u16) -> bool {
    matches!(code, 420 | 423 | 430)
}

fn bracketed(message_id: &str) -> String {
    if message_id.starts_with('<') {
        message_id.to_string()
    } else {
        format!("<{message_id}>")
    }
}

fn trim_crlf(line: &mut Vec<u8>) {
    while matches!(line.last(), Some(b'\n') | Some(b'\r')) {
        line.pop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, DuplexStream};

    /// Drive the client against a scripted server on a duplex pipe.
    async fn scripted_server(mut server: DuplexStream, script: Vec<(&'static str, String)>) {
        for (expect, reply) in script {
            let mut buf = vec![0u8; 512];
            let n = server.read(&mut buf).await.unwrap();
            let got = String::from_utf8_lossy(&buf[..n]);
            assert_eq!(got.trim_end(), expect);
            server.write_all(reply.as_bytes()).await.unwrap();
        }
    }

    #[tokio::test]
    async fn body_unstuffs_dots_and_counts_bytes() {
        let (client_side, server_side) = duplex(4096);
        let mut conn = NntpConnection::from_stream(client_side, "test");

        let body = "222 0 <a@b> body follows\r\nline one\r\n..stuffed\r\n.\r\n";
        let server = tokio::spawn(scripted_server(
            server_side,
            vec![("BODY <a@b>", body.to_string())],
        ));

        let mut sink = Vec::new();
        let transferred = conn.body("a@b", &mut sink, &[]).await.unwrap();
        server.await.unwrap();

        assert_eq!(sink, b"line one\r\n.stuffed\r\n");
        assert_eq!(transferred, sink.len() as u64);
    }

    #[tokio::test]
    async fn missing_article_maps_to_article_missing() {
        let (client_side, server_side) = duplex(4096);
        let mut conn = NntpConnection::from_stream(client_side, "test");

        let server = tokio::spawn(scripted_server(
            server_side,
            vec![("BODY <gone@b>", "430 no such article\r\n".to_string())],
        ));

        let mut sink = tokio::io::sink();
        let err = conn.body("gone@b", &mut sink, &[]).await.unwrap_err();
        server.await.unwrap();

        assert!(matches!(err, NntpError::ArticleMissing(id) if id == "gone@b"));
    }

    #[tokio::test]
    async fn missing_article_retries_after_group_select() {
        let (client_side, server_side) = duplex(4096);
        let mut conn = NntpConnection::from_stream(client_side, "test");

        let server = tokio::spawn(scripted_server(
            server_side,
            vec![
                ("BODY <a@b>", "430 not here\r\n".to_string()),
                ("GROUP alt.test", "211 10 1 10 alt.test\r\n".to_string()),
                ("BODY <a@b>", "222 0 <a@b>\r\npayload\r\n.\r\n".to_string()),
            ],
        ));

        let mut sink = Vec::new();
        let transferred = conn
            .body("a@b", &mut sink, &["alt.test".to_string()])
            .await
            .unwrap();
        server.await.unwrap();

        assert_eq!(transferred, 9);
        assert_eq!(sink, b"payload\r\n");
    }

    #[test]
    fn message_ids_are_bracketed_once() {
        assert_eq!(bracketed("a@b"), "<a@b>");
        assert_eq!(bracketed("<a@b>"), "<a@b>");
    }
}
