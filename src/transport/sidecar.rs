//! Sidecar transport: drives a helper process over newline-delimited JSON.
//!
//! The helper (typically a small Node script wrapping a browser-automation
//! WhatsApp client) reads requests on stdin and writes responses and events
//! on stdout:
//!
//! ```text
//! -> {"id":1,"method":"initialize","params":{...}}
//! <- {"event":"qr","params":{"qr":"2@abc..."}}
//! <- {"id":1,"result":null}
//! <- {"id":7,"error":{"message":"not connected"}}
//! ```
//!
//! Responses are matched to requests by `id`; anything carrying `event`
//! instead is decoded into a [`TransportEvent`] and forwarded in order.

use super::{
    Chat, ClientInfo, Transport, TransportEvent, TransportEventSender, TransportFactory,
    TransportOptions,
};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Reason reported when the helper's stdout closes without a `destroy`.
pub const EXITED_REASON: &str = "transport_exited";

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, String>>>>>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug, Serialize)]
struct Request<'a> {
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct RemoteError {
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Incoming {
    Response {
        id: u64,
        #[serde(default)]
        result: Option<Value>,
        #[serde(default)]
        error: Option<RemoteError>,
    },
    Event {
        event: String,
        #[serde(default)]
        params: Value,
    },
}

/// How long `destroy` waits for the helper to acknowledge before killing it.
const DESTROY_GRACE: Duration = Duration::from_secs(10);

/// Spawns one helper process per session attempt.
#[derive(Debug, Clone)]
pub struct SidecarFactory {
    command: String,
    args: Vec<String>,
}

impl SidecarFactory {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }
}

#[async_trait]
impl TransportFactory for SidecarFactory {
    fn name(&self) -> &str {
        "sidecar"
    }

    async fn create(
        &self,
        options: &TransportOptions,
        events: TransportEventSender,
    ) -> Result<Arc<dyn Transport>> {
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn transport sidecar `{}`", self.command))?;

        let stdin = child.stdin.take().context("sidecar stdin was not captured")?;
        let stdout = child
            .stdout
            .take()
            .context("sidecar stdout was not captured")?;

        tracing::info!(
            pid = child.id(),
            command = %self.command,
            "transport sidecar spawned"
        );

        let transport = SidecarTransport::from_io(stdin, stdout, options.clone(), events);
        *transport.child.lock() = Some(child);
        Ok(Arc::new(transport))
    }
}

/// One helper process (or any reader/writer pair speaking the same protocol).
pub struct SidecarTransport {
    options: TransportOptions,
    next_id: AtomicU64,
    pending: PendingMap,
    writer: tokio::sync::Mutex<BoxedWriter>,
    closing: Arc<AtomicBool>,
    reader: JoinHandle<()>,
    child: Mutex<Option<Child>>,
}

impl SidecarTransport {
    pub fn from_io<W, R>(
        writer: W,
        reader: R,
        options: TransportOptions,
        events: TransportEventSender,
    ) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
        R: AsyncRead + Send + Unpin + 'static,
    {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let closing = Arc::new(AtomicBool::new(false));
        let reader = tokio::spawn(read_loop(
            reader,
            Arc::clone(&pending),
            events,
            Arc::clone(&closing),
        ));

        Self {
            options,
            next_id: AtomicU64::new(0),
            pending,
            writer: tokio::sync::Mutex::new(Box::new(writer)),
            closing,
            reader,
            child: Mutex::new(None),
        }
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        let mut line = serde_json::to_vec(&Request { id, method, params })?;
        line.push(b'\n');

        let written = {
            let mut writer = self.writer.lock().await;
            match writer.write_all(&line).await {
                Ok(()) => writer.flush().await,
                Err(e) => Err(e),
            }
        };
        if let Err(e) = written {
            self.pending.lock().remove(&id);
            return Err(e).with_context(|| format!("Failed to write `{method}` to sidecar"));
        }

        match rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(message)) => bail!("sidecar `{method}` failed: {message}"),
            Err(_) => bail!("sidecar closed before answering `{method}`"),
        }
    }
}

#[async_trait]
impl Transport for SidecarTransport {
    async fn initialize(&self) -> Result<()> {
        let params = serde_json::to_value(&self.options)?;
        self.call("initialize", params).await.map(|_| ())
    }

    /// Ask the helper to shut down, kill it, and fail every request still
    /// waiting for an answer. No `disconnected` event is emitted.
    async fn destroy(&self) -> Result<()> {
        self.closing.store(true, Ordering::SeqCst);
        let acknowledged =
            tokio::time::timeout(DESTROY_GRACE, self.call("destroy", json!({}))).await;
        let result = match acknowledged {
            Ok(result) => result.map(|_| ()),
            Err(_) => Err(anyhow::anyhow!(
                "sidecar did not acknowledge destroy within {DESTROY_GRACE:?}"
            )),
        };

        let child = self.child.lock().take();
        if let Some(mut child) = child {
            if let Err(e) = child.kill().await {
                tracing::warn!("Failed to kill transport sidecar: {e}");
            }
        }
        self.reader.abort();
        fail_pending(&self.pending, "transport destroyed");
        result
    }

    async fn get_state(&self) -> Result<Option<String>> {
        let value = self.call("getState", json!({})).await?;
        Ok(value.as_str().map(str::to_string))
    }

    async fn send_message(&self, to: &str, body: &str) -> Result<()> {
        self.call("sendMessage", json!({ "to": to, "message": body }))
            .await
            .map(|_| ())
    }

    async fn get_chats(&self) -> Result<Vec<Chat>> {
        let value = self.call("getChats", json!({})).await?;
        serde_json::from_value(value).context("Invalid getChats payload from sidecar")
    }

    async fn info(&self) -> Result<Option<ClientInfo>> {
        let value = self.call("getInfo", json!({})).await?;
        if value.is_null() {
            return Ok(None);
        }
        serde_json::from_value(value)
            .map(Some)
            .context("Invalid getInfo payload from sidecar")
    }
}

impl Drop for SidecarTransport {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_loop<R>(
    reader: R,
    pending: PendingMap,
    events: TransportEventSender,
    closing: Arc<AtomicBool>,
) where
    R: AsyncRead + Send + Unpin + 'static,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => dispatch_line(&line, &pending, &events),
            Ok(None) => break,
            Err(e) => {
                tracing::warn!("Transport sidecar read error: {e}");
                break;
            }
        }
    }

    fail_pending(&pending, "transport closed");
    if !closing.load(Ordering::SeqCst) {
        let _ = events.send(TransportEvent::Disconnected(EXITED_REASON.into()));
    }
}

fn fail_pending(pending: &PendingMap, reason: &str) {
    for (_, tx) in pending.lock().drain() {
        let _ = tx.send(Err(reason.to_string()));
    }
}

fn dispatch_line(line: &str, pending: &PendingMap, events: &TransportEventSender) {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return;
    }

    match serde_json::from_str::<Incoming>(trimmed) {
        Ok(Incoming::Response { id, result, error }) => {
            let Some(tx) = pending.lock().remove(&id) else {
                tracing::debug!(id, "Dropping sidecar response with no pending request");
                return;
            };
            let outcome = match error {
                Some(err) => Err(err.message),
                None => Ok(result.unwrap_or(Value::Null)),
            };
            let _ = tx.send(outcome);
        }
        Ok(Incoming::Event { event, params }) => match decode_event(&event, &params) {
            Some(ev) => {
                let _ = events.send(ev);
            }
            None => tracing::debug!(event = %event, "Ignoring unknown sidecar event"),
        },
        Err(e) => {
            tracing::warn!("Unparseable sidecar line ({e}): {trimmed}");
        }
    }
}

fn str_param(params: &Value, key: &str) -> Option<String> {
    params.get(key).and_then(Value::as_str).map(str::to_string)
}

fn decode_event(name: &str, params: &Value) -> Option<TransportEvent> {
    let event = match name {
        "qr" => TransportEvent::Challenge(str_param(params, "qr")?),
        "authenticated" => TransportEvent::Authenticated,
        "ready" => TransportEvent::Ready,
        "disconnected" => TransportEvent::Disconnected(
            str_param(params, "reason").unwrap_or_else(|| "unknown".into()),
        ),
        "auth_failure" => TransportEvent::AuthFailure(
            str_param(params, "message").unwrap_or_else(|| "unknown".into()),
        ),
        "loading_screen" => {
            let percent = params
                .get("percent")
                .and_then(Value::as_u64)
                .unwrap_or(0)
                .min(100);
            TransportEvent::LoadingScreen {
                percent: u8::try_from(percent).unwrap_or(100),
                message: str_param(params, "message").unwrap_or_default(),
            }
        }
        "change_state" => TransportEvent::StateChanged(str_param(params, "state")?),
        _ => return None,
    };
    Some(event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;
    use tokio::io::{duplex, DuplexStream, Lines};
    use tokio::sync::mpsc;

    fn options() -> TransportOptions {
        TransportOptions {
            data_path: PathBuf::from("data"),
            cache_path: PathBuf::from("cache"),
            headless: true,
            protocol_timeout: Duration::from_secs(180),
            browser_args: vec![],
            takeover_on_conflict: true,
            takeover_timeout_ms: 0,
            restart_on_auth_fail: true,
            qr_max_retries: 8,
        }
    }

    struct FakeSidecar {
        requests: Lines<BufReader<DuplexStream>>,
        out: DuplexStream,
    }

    impl FakeSidecar {
        async fn next_request(&mut self) -> Value {
            let line = self.requests.next_line().await.unwrap().unwrap();
            serde_json::from_str(&line).unwrap()
        }

        async fn write(&mut self, value: Value) {
            let mut line = serde_json::to_vec(&value).unwrap();
            line.push(b'\n');
            self.out.write_all(&line).await.unwrap();
        }
    }

    fn connect() -> (
        SidecarTransport,
        FakeSidecar,
        mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        let (to_sidecar, sidecar_in) = duplex(8 * 1024);
        let (sidecar_out, from_sidecar) = duplex(8 * 1024);
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = SidecarTransport::from_io(to_sidecar, from_sidecar, options(), tx);
        let fake = FakeSidecar {
            requests: BufReader::new(sidecar_in).lines(),
            out: sidecar_out,
        };
        (transport, fake, rx)
    }

    #[tokio::test]
    async fn initialize_sends_options_and_awaits_response() {
        let (transport, mut sidecar, _rx) = connect();

        let call = tokio::spawn(async move { transport.initialize().await });
        let request = sidecar.next_request().await;
        assert_eq!(request["method"], "initialize");
        assert_eq!(request["params"]["qrMaxRetries"], 8);

        sidecar
            .write(json!({ "id": request["id"], "result": null }))
            .await;
        assert!(call.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn remote_error_is_surfaced() {
        let (transport, mut sidecar, _rx) = connect();

        let call = tokio::spawn(async move { transport.send_message("123", "hi").await });
        let request = sidecar.next_request().await;
        assert_eq!(request["params"]["to"], "123");
        assert_eq!(request["params"]["message"], "hi");

        sidecar
            .write(json!({ "id": request["id"], "error": { "message": "not connected" } }))
            .await;
        let err = call.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("not connected"));
    }

    #[tokio::test]
    async fn events_are_forwarded_in_order() {
        let (_transport, mut sidecar, mut rx) = connect();

        sidecar
            .write(json!({ "event": "qr", "params": { "qr": "2@payload" } }))
            .await;
        sidecar.write(json!({ "event": "authenticated" })).await;
        sidecar.write(json!({ "event": "ready" })).await;

        assert_eq!(
            rx.recv().await,
            Some(TransportEvent::Challenge("2@payload".into()))
        );
        assert_eq!(rx.recv().await, Some(TransportEvent::Authenticated));
        assert_eq!(rx.recv().await, Some(TransportEvent::Ready));
    }

    #[tokio::test]
    async fn closed_stdout_reports_disconnect_and_fails_pending() {
        let (transport, mut sidecar, mut rx) = connect();

        let call = tokio::spawn(async move { transport.get_state().await });
        let _ = sidecar.next_request().await;
        drop(sidecar);

        assert!(call.await.unwrap().is_err());
        assert_eq!(
            rx.recv().await,
            Some(TransportEvent::Disconnected(EXITED_REASON.into()))
        );
    }

    #[tokio::test]
    async fn destroy_fails_pending_and_emits_no_disconnect() {
        let (transport, mut sidecar, mut rx) = connect();
        let transport = Arc::new(transport);

        let init = tokio::spawn({
            let transport = Arc::clone(&transport);
            async move { transport.initialize().await }
        });
        assert_eq!(sidecar.next_request().await["method"], "initialize");

        let destroy = tokio::spawn({
            let transport = Arc::clone(&transport);
            async move { transport.destroy().await }
        });
        let request = sidecar.next_request().await;
        assert_eq!(request["method"], "destroy");
        sidecar
            .write(json!({ "id": request["id"], "result": null }))
            .await;

        assert!(destroy.await.unwrap().is_ok());
        let err = tokio::time::timeout(Duration::from_secs(3), init)
            .await
            .expect("initialize should resolve once destroyed")
            .unwrap()
            .unwrap_err();
        assert!(err.to_string().contains("transport destroyed"));
        assert!(transport.pending.lock().is_empty());

        // The reader is gone and never reported the closed pipe.
        drop(sidecar);
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn destroy_without_acknowledgement_still_fails_pending() {
        let (transport, mut sidecar, _rx) = connect();
        let transport = Arc::new(transport);

        let chats = tokio::spawn({
            let transport = Arc::clone(&transport);
            async move { transport.get_chats().await }
        });
        let _ = sidecar.next_request().await;

        // Helper never answers `destroy`; the grace period elapses.
        let result = transport.destroy().await;
        assert!(result.is_err());
        assert!(chats.await.unwrap().is_err());
        assert!(transport.pending.lock().is_empty());
    }

    #[test]
    fn decode_event_covers_known_names() {
        assert_eq!(
            decode_event("disconnected", &json!({ "reason": "NAVIGATION" })),
            Some(TransportEvent::Disconnected("NAVIGATION".into()))
        );
        assert_eq!(
            decode_event("loading_screen", &json!({ "percent": 250, "message": "WhatsApp" })),
            Some(TransportEvent::LoadingScreen {
                percent: 100,
                message: "WhatsApp".into()
            })
        );
        assert_eq!(decode_event("qr", &json!({})), None);
        assert_eq!(decode_event("message_create", &json!({})), None);
    }

    #[test]
    fn get_info_null_maps_to_none() {
        let info: Option<ClientInfo> = serde_json::from_value(Value::Null).unwrap();
        assert!(info.is_none());
    }
}
