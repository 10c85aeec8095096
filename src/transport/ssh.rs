//! ssh transport: the client side of the replication protocol
//!
//! spawns `ori serve --stdio <path>` on the remote host through ssh and
//! speaks the line protocol over the child's pipes.

use std::io::{BufRead, BufReader, Read, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

use tracing::debug;

use crate::error::{Error, Result};
use crate::hash::Hash;
use crate::object::ObjectType;
use crate::transport::RemoteSource;

/// a pull source reached over an ssh child process
pub struct SshSource {
    child: Child,
    reader: BufReader<ChildStdout>,
    writer: ChildStdin,
}

impl SshSource {
    /// connect to `[user@]host:path`
    pub fn connect(remote: &str) -> Result<Self> {
        let (host, path) = parse_remote(remote)?;

        debug!(%host, %path, "spawning ssh transport");
        let child = Command::new("ssh")
            .arg(&host)
            .arg("ori")
            .arg("serve")
            .arg("--stdio")
            .arg(&path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| Error::Transport {
                message: format!("failed to spawn ssh: {}", e),
            })?;

        Self::from_child(child)
    }

    /// wrap an already-spawned serve process (used for local process pipes)
    pub fn from_child(mut child: Child) -> Result<Self> {
        let stdout = child.stdout.take().ok_or_else(|| Error::Transport {
            message: "stdout not available".to_string(),
        })?;
        let stdin = child.stdin.take().ok_or_else(|| Error::Transport {
            message: "stdin not available".to_string(),
        })?;

        Ok(Self {
            child,
            reader: BufReader::new(stdout),
            writer: stdin,
        })
    }

    /// send one request line and return the `ok` response tail
    fn command(&mut self, request: &str) -> Result<String> {
        writeln!(self.writer, "{}", request).map_err(|e| Error::Transport {
            message: format!("write failed: {}", e),
        })?;
        self.writer.flush().map_err(|e| Error::Transport {
            message: format!("flush failed: {}", e),
        })?;

        let mut line = String::new();
        let n = self.reader.read_line(&mut line).map_err(|e| Error::Transport {
            message: format!("read failed: {}", e),
        })?;
        if n == 0 {
            return Err(Error::Transport {
                message: "connection closed by peer".to_string(),
            });
        }

        let line = line.trim_end();
        if let Some(rest) = line.strip_prefix("ok") {
            return Ok(rest.trim_start().to_string());
        }
        if let Some(message) = line.strip_prefix("err ") {
            return Err(Error::Transport {
                message: message.to_string(),
            });
        }
        Err(Error::Transport {
            message: format!("malformed response: {}", line),
        })
    }

    /// end the session and reap the child
    pub fn close(mut self) -> Result<()> {
        let _ = writeln!(self.writer, "bye");
        let _ = self.writer.flush();
        self.child.wait().map_err(|e| Error::Transport {
            message: format!("wait failed: {}", e),
        })?;
        Ok(())
    }
}

impl Drop for SshSource {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl RemoteSource for SshSource {
    fn head(&mut self) -> Result<Hash> {
        let response = self.command("head")?;
        Hash::from_hex(&response)
    }

    fn list_heads(&mut self) -> Result<Vec<Hash>> {
        let count: usize = self
            .command("list-heads")?
            .parse()
            .map_err(|_| Error::Transport {
                message: "malformed list-heads count".to_string(),
            })?;

        let mut heads = Vec::with_capacity(count);
        for _ in 0..count {
            let mut line = String::new();
            self.reader.read_line(&mut line).map_err(|e| Error::Transport {
                message: format!("read failed: {}", e),
            })?;
            heads.push(Hash::from_hex(line.trim())?);
        }
        Ok(heads)
    }

    fn has_object(&mut self, hash: &Hash) -> Result<bool> {
        let response = self.command(&format!("has {}", hash.to_hex()))?;
        Ok(response == "1")
    }

    fn object_type(&mut self, hash: &Hash) -> Result<ObjectType> {
        let response = self.command(&format!("type {}", hash.to_hex()))?;
        ObjectType::from_tag(response.as_bytes())
    }

    fn get_object(&mut self, hash: &Hash) -> Result<Vec<u8>> {
        let len: usize = self
            .command(&format!("get {}", hash.to_hex()))?
            .parse()
            .map_err(|_| Error::Transport {
                message: "malformed get length".to_string(),
            })?;

        let mut payload = vec![0u8; len];
        self.reader
            .read_exact(&mut payload)
            .map_err(|e| Error::Transport {
                message: format!("short object read: {}", e),
            })?;
        Ok(payload)
    }
}

/// split `[user@]host:path` into (ssh destination, remote path)
pub fn parse_remote(remote: &str) -> Result<(String, String)> {
    match remote.split_once(':') {
        Some((host, path)) if !host.is_empty() && !path.is_empty() => {
            Ok((host.to_string(), path.to_string()))
        }
        _ => Err(Error::InvalidArgument(format!(
            "remote must be [user@]host:path, got: {}",
            remote
        ))),
    }
}

/// true when a source string names a remote rather than a local path
pub fn is_remote_path(s: &str) -> bool {
    match s.split_once(':') {
        Some((host, _)) => !host.contains('/'),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_remote() {
        assert_eq!(
            parse_remote("host:/var/repo").unwrap(),
            ("host".to_string(), "/var/repo".to_string())
        );
        assert_eq!(
            parse_remote("user@host:repo").unwrap(),
            ("user@host".to_string(), "repo".to_string())
        );
        assert!(parse_remote("nopath").is_err());
        assert!(parse_remote(":path").is_err());
    }

    #[test]
    fn test_is_remote_path() {
        assert!(is_remote_path("host:/var/repo"));
        assert!(is_remote_path("user@host:repo"));
        assert!(!is_remote_path("/local/path"));
        assert!(!is_remote_path("relative/path:odd"));
        assert!(!is_remote_path("plain"));
    }
}
