//! Control protocol: one JSON object per line in each direction over the
//! daemon's Unix socket. Commands are `status`, `sync`, `delete` and `stop`.

use std::io::{self, BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{io_err, DaemonError};
use crate::paths::socket_path;

const STATUS_ATTEMPTS: u32 = 5;
const STATUS_RETRY_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DaemonRequest {
    pub cmd: String,
    /// Target unit id for `sync` and `delete`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    /// `delete` only: bypass the stuck-deletion guard.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub force: bool,
}

impl DaemonRequest {
    pub fn new(cmd: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DaemonResponse {
    pub fn ok(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(message.into()),
        }
    }

    /// The payload of a successful response; a failed one becomes
    /// [`DaemonError::Protocol`] carrying the daemon's message.
    pub fn into_data(self) -> Result<Value, DaemonError> {
        match (self.ok, self.error) {
            (true, _) => Ok(self.data.unwrap_or(Value::Null)),
            (false, Some(message)) => Err(DaemonError::Protocol(message)),
            (false, None) => Err(DaemonError::Protocol(
                "daemon reported an unspecified error".into(),
            )),
        }
    }
}

fn connect(socket: PathBuf) -> Result<(UnixStream, PathBuf), DaemonError> {
    match UnixStream::connect(&socket) {
        Ok(stream) => Ok((stream, socket)),
        Err(err)
            if matches!(
                err.kind(),
                io::ErrorKind::NotFound
                    | io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionReset
            ) =>
        {
            Err(DaemonError::DaemonNotRunning { socket })
        }
        Err(err) => Err(io_err(&socket, err)),
    }
}

/// One request, one response line. A missing or dead socket is
/// [`DaemonError::DaemonNotRunning`].
pub fn send_request(home: &Path, request: &DaemonRequest) -> Result<DaemonResponse, DaemonError> {
    let (mut stream, socket) = connect(socket_path(home))?;

    let mut frame = serde_json::to_vec(request)?;
    frame.push(b'\n');
    stream
        .write_all(&frame)
        .and_then(|()| stream.flush())
        .map_err(|e| io_err(&socket, e))?;

    let mut line = String::new();
    let n = BufReader::new(&stream)
        .read_line(&mut line)
        .map_err(|e| io_err(&socket, e))?;
    if n == 0 {
        return Err(DaemonError::Protocol(format!(
            "no response from daemon at {}",
            socket.display()
        )));
    }
    Ok(serde_json::from_str(line.trim_end())?)
}

/// Daemon status. A daemon that is still binding its socket gets a few
/// short retries before it counts as not running.
pub fn request_status(home: &Path) -> Result<Value, DaemonError> {
    let request = DaemonRequest::new("status");
    let mut attempt = 1;
    loop {
        match send_request(home, &request) {
            Err(DaemonError::DaemonNotRunning { .. }) if attempt < STATUS_ATTEMPTS => {
                attempt += 1;
                std::thread::sleep(STATUS_RETRY_DELAY);
            }
            other => return other?.into_data(),
        }
    }
}

pub fn request_stop(home: &Path) -> Result<(), DaemonError> {
    send_request(home, &DaemonRequest::new("stop"))?.into_data()?;
    Ok(())
}

/// Reload the source and reconcile, or force-sync one unit.
pub fn request_sync(home: &Path, unit: Option<String>) -> Result<Value, DaemonError> {
    let request = DaemonRequest {
        unit,
        ..DaemonRequest::new("sync")
    };
    send_request(home, &request)?.into_data()
}

pub fn request_delete(home: &Path, unit: String, force: bool) -> Result<Value, DaemonError> {
    let request = DaemonRequest {
        unit: Some(unit),
        force,
        ..DaemonRequest::new("delete")
    };
    send_request(home, &request)?.into_data()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn optional_fields_are_omitted_on_the_wire() {
        let encoded = serde_json::to_value(DaemonRequest::new("status")).expect("encode");
        assert_eq!(encoded, json!({"cmd": "status"}));

        let delete = DaemonRequest {
            unit: Some("app/web".to_string()),
            force: true,
            ..DaemonRequest::new("delete")
        };
        let encoded = serde_json::to_value(&delete).expect("encode");
        assert_eq!(encoded, json!({"cmd": "delete", "unit": "app/web", "force": true}));
    }

    #[test]
    fn minimal_request_decodes_with_defaults() {
        let request: DaemonRequest = serde_json::from_str(r#"{"cmd":"sync"}"#).expect("decode");
        assert_eq!(request, DaemonRequest::new("sync"));
    }

    #[test]
    fn missing_socket_means_not_running() {
        let home = TempDir::new().expect("home");
        let err = send_request(home.path(), &DaemonRequest::new("status")).unwrap_err();
        assert!(matches!(err, DaemonError::DaemonNotRunning { .. }));
    }

    #[test]
    fn error_response_becomes_protocol_error() {
        let err = DaemonResponse::error("unit 'x' not found").into_data().unwrap_err();
        assert!(err.to_string().contains("unit 'x' not found"));
    }
}
