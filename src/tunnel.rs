//! TLS tunnel launcher (§4.2, §6).
//!
//! Delegates the TLS handshake to an external proxy executable rather than
//! linking a TLS stack into the coordinator: bind a loopback listener, spawn
//! the proxy pointed at it and at the remote endpoint, wait for the proxy to
//! connect back, then adopt the accepted socket as the plaintext transport.

use std::io;
use std::net::{TcpListener, TcpStream};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use crate::constants::{CONNECT_POLL_INTERVAL, TUNNEL_CONNECT_TIMEOUT};
use crate::error::CoreError;

#[derive(Debug, Clone)]
pub struct TunnelTarget {
    pub remote_host: String,
    pub remote_port: u16,
    pub reconnect_target: Option<(String, u16)>,
}

/// A live tunnel: the plaintext loopback socket plus a handle on the proxy
/// sub-process so teardown can terminate it.
pub struct Tunnel {
    pub stream: TcpStream,
    child: Child,
}

impl Tunnel {
    /// Runs the full launch sequence described in §4.2, failing with
    /// `CoreError::Transport` ("TunnelStartFailed") if the proxy exits
    /// before accepting the loopback connection or the connect timeout
    /// (default 10 s) elapses first.
    pub fn launch(proxy_path: &std::path::Path, target: &TunnelTarget) -> Result<Self, CoreError> {
        let listener = TcpListener::bind(("127.0.0.1", 0)).map_err(CoreError::from)?;
        listener.set_nonblocking(true).map_err(CoreError::from)?;
        let local_port = listener.local_addr().map_err(CoreError::from)?.port();

        let mut cmd = Command::new(proxy_path);
        cmd.arg("localhost")
            .arg(local_port.to_string())
            .arg(&target.remote_host)
            .arg(target.remote_port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if let Some((host, port)) = &target.reconnect_target {
            cmd.arg("-r").arg(format!("{host}:{port}"));
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| CoreError::Transport(format!("failed to spawn tunnel proxy: {e}")))?;

        let deadline = Instant::now() + TUNNEL_CONNECT_TIMEOUT;
        loop {
            if let Some(status) = child.try_wait().map_err(CoreError::from)? {
                return Err(CoreError::Transport(format!(
                    "tunnel proxy exited before accepting connection (status: {status})"
                )));
            }

            match listener.accept() {
                Ok((stream, _addr)) => {
                    stream.set_nonblocking(false).map_err(CoreError::from)?;
                    drop(listener);
                    return Ok(Self { stream, child });
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(CoreError::from(e)),
            }

            if Instant::now() >= deadline {
                let _ = child.kill();
                return Err(CoreError::Timeout("tunnel proxy did not connect in time".to_string()));
            }
            std::thread::sleep(CONNECT_POLL_INTERVAL.min(Duration::from_millis(50)));
        }
    }

}

impl Drop for Tunnel {
    /// Terminates the proxy sub-process on every teardown path — a
    /// disconnect, a reconnect, or the broker dropping a `Conn` — so the
    /// proxy never outlives the tunnel it was spawned for (§4.2/§6).
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn launch_fails_fast_when_proxy_binary_is_missing() {
        let target = TunnelTarget {
            remote_host: "example.invalid".to_string(),
            remote_port: 443,
            reconnect_target: None,
        };
        let result = Tunnel::launch(std::path::Path::new("/nonexistent/kwm-proxy"), &target);
        assert!(result.is_err());
    }
}
