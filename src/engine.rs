use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use crate::error::EngineError;

/// Seek imprecision allowed on preview load: the engine may start up to this
/// many milliseconds before `start_offset_ms` (codec/GOP granularity), never
/// earlier.
pub const SEEK_TOLERANCE_MS: i64 = 2000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartChannelReply {
    pub success: bool,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadPreviewReply {
    pub success: bool,
    pub shadow_decode_started: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchToLiveReply {
    pub success: bool,
    pub pts_contiguous: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionReply {
    pub build: String,
    pub schema_version: u32,
}

/// Control-plane RPC surface of the playout engine. The core issues these;
/// the engine renders. `hard_stop_time_ms` is authoritative wherever it
/// appears: no output may be emitted past it.
pub trait EngineControl: Send + Sync + 'static {
    /// Idempotent: success on an already-started channel.
    fn start_channel(
        &self,
        channel_id: &str,
        plan_handle: &str,
        port: u16,
    ) -> impl Future<Output = Result<StartChannelReply, EngineError>> + Send;

    /// Error before `start_channel` for the channel.
    fn load_preview(
        &self,
        channel_id: &str,
        uri: &str,
        start_offset_ms: i64,
        hard_stop_time_ms: i64,
    ) -> impl Future<Output = Result<LoadPreviewReply, EngineError>> + Send;

    /// Error with no preview loaded; swaps the seam with PTS continuity.
    fn switch_to_live(
        &self,
        channel_id: &str,
    ) -> impl Future<Output = Result<SwitchToLiveReply, EngineError>> + Send;

    /// Optional in Phase-0 engines; never issued while a channel is live.
    fn update_plan(
        &self,
        channel_id: &str,
        plan_handle: &str,
    ) -> impl Future<Output = Result<(), EngineError>> + Send;

    /// Idempotent: success on an unknown or already-stopped channel.
    fn stop_channel(&self, channel_id: &str) -> impl Future<Output = Result<(), EngineError>> + Send;

    fn get_version(&self) -> impl Future<Output = Result<VersionReply, EngineError>> + Send;
}

// ── Wire protocol (JSON lines over TCP) ────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum EngineRequest {
    StartChannel {
        channel_id: String,
        plan_handle: String,
        port: u16,
    },
    LoadPreview {
        channel_id: String,
        uri: String,
        start_offset_ms: i64,
        hard_stop_time_ms: i64,
    },
    SwitchToLive {
        channel_id: String,
    },
    UpdatePlan {
        channel_id: String,
        plan_handle: String,
    },
    StopChannel {
        channel_id: String,
    },
    GetVersion,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct EngineWireReply {
    success: bool,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    detail: Option<String>,
    #[serde(default)]
    shadow_decode_started: Option<bool>,
    #[serde(default)]
    pts_contiguous: Option<bool>,
    #[serde(default)]
    build: Option<String>,
    #[serde(default)]
    schema_version: Option<u32>,
}

/// One-request-per-connection JSON-line client. Control RPCs are rare, so a
/// fresh connection per call keeps the failure surface small; the whole
/// exchange is bounded by `rpc_timeout_ms`.
#[derive(Clone)]
pub struct TcpEngineClient {
    addr: String,
    rpc_timeout_ms: u64,
}

impl TcpEngineClient {
    pub fn new(addr: impl Into<String>, rpc_timeout_ms: u64) -> Self {
        Self {
            addr: addr.into(),
            rpc_timeout_ms,
        }
    }

    async fn call(&self, channel_id: &str, op: &'static str, request: EngineRequest) -> Result<EngineWireReply, EngineError> {
        let exchange = async {
            let stream = TcpStream::connect(&self.addr)
                .await
                .map_err(|e| EngineError::Transport(e.to_string()))?;
            let (read_half, mut write_half) = stream.into_split();

            let mut line = serde_json::to_string(&request).map_err(|e| EngineError::Transport(e.to_string()))?;
            line.push('\n');
            write_half
                .write_all(line.as_bytes())
                .await
                .map_err(|e| EngineError::Transport(e.to_string()))?;

            let mut reader = BufReader::new(read_half);
            let mut reply_line = String::new();
            let n = reader
                .read_line(&mut reply_line)
                .await
                .map_err(|e| EngineError::Transport(e.to_string()))?;
            if n == 0 {
                return Err(EngineError::Transport("engine closed the connection".to_string()));
            }
            serde_json::from_str::<EngineWireReply>(reply_line.trim())
                .map_err(|e| EngineError::Transport(format!("bad reply: {e}")))
        };

        let reply = tokio::time::timeout(std::time::Duration::from_millis(self.rpc_timeout_ms), exchange)
            .await
            .map_err(|_| EngineError::Timeout {
                timeout_ms: self.rpc_timeout_ms,
            })??;

        if !reply.success {
            return Err(match reply.code.as_deref() {
                Some("not_started") => EngineError::NotStarted {
                    channel_id: channel_id.to_string(),
                },
                Some("no_preview") => EngineError::NoPreviewLoaded {
                    channel_id: channel_id.to_string(),
                },
                _ => EngineError::Rejected {
                    op,
                    detail: reply.detail.unwrap_or_else(|| "engine refused".to_string()),
                },
            });
        }
        Ok(reply)
    }
}

impl EngineControl for TcpEngineClient {
    async fn start_channel(
        &self,
        channel_id: &str,
        plan_handle: &str,
        port: u16,
    ) -> Result<StartChannelReply, EngineError> {
        let reply = self
            .call(
                channel_id,
                "StartChannel",
                EngineRequest::StartChannel {
                    channel_id: channel_id.to_string(),
                    plan_handle: plan_handle.to_string(),
                    port,
                },
            )
            .await?;
        Ok(StartChannelReply {
            success: reply.success,
            detail: reply.detail,
        })
    }

    async fn load_preview(
        &self,
        channel_id: &str,
        uri: &str,
        start_offset_ms: i64,
        hard_stop_time_ms: i64,
    ) -> Result<LoadPreviewReply, EngineError> {
        let reply = self
            .call(
                channel_id,
                "LoadPreview",
                EngineRequest::LoadPreview {
                    channel_id: channel_id.to_string(),
                    uri: uri.to_string(),
                    start_offset_ms,
                    hard_stop_time_ms,
                },
            )
            .await?;
        Ok(LoadPreviewReply {
            success: reply.success,
            shadow_decode_started: reply.shadow_decode_started,
        })
    }

    async fn switch_to_live(&self, channel_id: &str) -> Result<SwitchToLiveReply, EngineError> {
        let reply = self
            .call(
                channel_id,
                "SwitchToLive",
                EngineRequest::SwitchToLive {
                    channel_id: channel_id.to_string(),
                },
            )
            .await?;
        Ok(SwitchToLiveReply {
            success: reply.success,
            pts_contiguous: reply.pts_contiguous,
        })
    }

    async fn update_plan(&self, channel_id: &str, plan_handle: &str) -> Result<(), EngineError> {
        self.call(
            channel_id,
            "UpdatePlan",
            EngineRequest::UpdatePlan {
                channel_id: channel_id.to_string(),
                plan_handle: plan_handle.to_string(),
            },
        )
        .await?;
        Ok(())
    }

    async fn stop_channel(&self, channel_id: &str) -> Result<(), EngineError> {
        self.call(
            channel_id,
            "StopChannel",
            EngineRequest::StopChannel {
                channel_id: channel_id.to_string(),
            },
        )
        .await?;
        Ok(())
    }

    async fn get_version(&self) -> Result<VersionReply, EngineError> {
        let reply = self.call("", "GetVersion", EngineRequest::GetVersion).await?;
        Ok(VersionReply {
            build: reply.build.unwrap_or_default(),
            schema_version: reply.schema_version.unwrap_or(0),
        })
    }
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// In-memory engine with the Phase-0 semantics: idempotent start/stop,
    /// preview gating, and a call journal for assertions.
    #[derive(Default)]
    pub struct FakeEngine {
        pub calls: Mutex<Vec<String>>,
        started: Mutex<HashSet<String>>,
        preview: Mutex<HashSet<String>>,
        /// When set, the named op fails once with a transport error.
        pub fail_once: Mutex<Option<&'static str>>,
        /// When set, the named op hangs forever (for timeout tests).
        pub hang_on: Mutex<Option<&'static str>>,
    }

    impl FakeEngine {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }

        async fn gate(&self, op: &'static str) -> Result<(), EngineError> {
            if self.hang_on.lock().unwrap().as_deref() == Some(op) {
                std::future::pending::<()>().await;
            }
            let should_fail = {
                let mut fail = self.fail_once.lock().unwrap();
                if fail.as_deref() == Some(op) {
                    *fail = None;
                    true
                } else {
                    false
                }
            };
            if should_fail {
                return Err(EngineError::Transport(format!("{op} injected failure")));
            }
            Ok(())
        }
    }

    impl EngineControl for FakeEngine {
        async fn start_channel(
            &self,
            channel_id: &str,
            _plan_handle: &str,
            port: u16,
        ) -> Result<StartChannelReply, EngineError> {
            self.gate("StartChannel").await?;
            self.record(format!("StartChannel({channel_id}, port={port})"));
            self.started.lock().unwrap().insert(channel_id.to_string());
            Ok(StartChannelReply {
                success: true,
                detail: None,
            })
        }

        async fn load_preview(
            &self,
            channel_id: &str,
            uri: &str,
            start_offset_ms: i64,
            hard_stop_time_ms: i64,
        ) -> Result<LoadPreviewReply, EngineError> {
            self.gate("LoadPreview").await?;
            if !self.started.lock().unwrap().contains(channel_id) {
                return Err(EngineError::NotStarted {
                    channel_id: channel_id.to_string(),
                });
            }
            self.record(format!(
                "LoadPreview({channel_id}, {uri}, offset={start_offset_ms}, hard_stop={hard_stop_time_ms})"
            ));
            self.preview.lock().unwrap().insert(channel_id.to_string());
            Ok(LoadPreviewReply {
                success: true,
                shadow_decode_started: Some(true),
            })
        }

        async fn switch_to_live(&self, channel_id: &str) -> Result<SwitchToLiveReply, EngineError> {
            self.gate("SwitchToLive").await?;
            if !self.preview.lock().unwrap().remove(channel_id) {
                return Err(EngineError::NoPreviewLoaded {
                    channel_id: channel_id.to_string(),
                });
            }
            self.record(format!("SwitchToLive({channel_id})"));
            Ok(SwitchToLiveReply {
                success: true,
                pts_contiguous: Some(true),
            })
        }

        async fn update_plan(&self, channel_id: &str, _plan_handle: &str) -> Result<(), EngineError> {
            self.record(format!("UpdatePlan({channel_id})"));
            Ok(())
        }

        async fn stop_channel(&self, channel_id: &str) -> Result<(), EngineError> {
            self.gate("StopChannel").await?;
            self.record(format!("StopChannel({channel_id})"));
            self.started.lock().unwrap().remove(channel_id);
            self.preview.lock().unwrap().remove(channel_id);
            Ok(())
        }

        async fn get_version(&self) -> Result<VersionReply, EngineError> {
            Ok(VersionReply {
                build: "fake".to_string(),
                schema_version: 1,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_support::FakeEngine;

    #[tokio::test]
    async fn fake_engine_enforces_rpc_ordering() {
        let engine = FakeEngine::new();

        // LoadPreview before StartChannel: error
        let err = engine.load_preview("ch", "file:///m.ts", 0, 1000).await.unwrap_err();
        assert!(matches!(err, EngineError::NotStarted { .. }));

        engine.start_channel("ch", "plan-0", 9000).await.unwrap();
        // Idempotent restart
        engine.start_channel("ch", "plan-0", 9000).await.unwrap();

        // SwitchToLive without preview: error
        let err = engine.switch_to_live("ch").await.unwrap_err();
        assert!(matches!(err, EngineError::NoPreviewLoaded { .. }));

        engine.load_preview("ch", "file:///m.ts", 0, 1000).await.unwrap();
        let reply = engine.switch_to_live("ch").await.unwrap();
        assert_eq!(reply.pts_contiguous, Some(true));

        // Stop is idempotent, even for unknown channels
        engine.stop_channel("ch").await.unwrap();
        engine.stop_channel("never-started").await.unwrap();
    }

    /// Minimal loopback engine speaking the wire protocol, for client tests.
    async fn spawn_wire_engine() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else { return };
                tokio::spawn(async move {
                    let (read_half, mut write_half) = stream.into_split();
                    let mut reader = BufReader::new(read_half);
                    let mut line = String::new();
                    if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
                        return;
                    }
                    let request: EngineRequest = match serde_json::from_str(line.trim()) {
                        Ok(r) => r,
                        Err(_) => return,
                    };
                    let reply = match request {
                        EngineRequest::GetVersion => EngineWireReply {
                            success: true,
                            build: Some("wire-test".to_string()),
                            schema_version: Some(1),
                            ..Default::default()
                        },
                        EngineRequest::SwitchToLive { .. } => EngineWireReply {
                            success: false,
                            code: Some("no_preview".to_string()),
                            ..Default::default()
                        },
                        _ => EngineWireReply {
                            success: true,
                            ..Default::default()
                        },
                    };
                    let mut out = serde_json::to_string(&reply).unwrap();
                    out.push('\n');
                    let _ = write_half.write_all(out.as_bytes()).await;
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn tcp_client_round_trips_and_maps_error_codes() {
        let addr = spawn_wire_engine().await;
        let client = TcpEngineClient::new(addr, 2000);

        let version = client.get_version().await.unwrap();
        assert_eq!(version.build, "wire-test");
        assert_eq!(version.schema_version, 1);

        client.start_channel("ch", "plan-0", 9000).await.unwrap();

        let err = client.switch_to_live("ch").await.unwrap_err();
        assert!(matches!(err, EngineError::NoPreviewLoaded { .. }));
    }

    #[tokio::test]
    async fn rpc_timeout_is_bounded() {
        // A listener that accepts and never replies
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let mut held = Vec::new();
            loop {
                let Ok((stream, _)) = listener.accept().await else { return };
                held.push(stream);
            }
        });

        let client = TcpEngineClient::new(addr, 100);
        let err = client.get_version().await.unwrap_err();
        assert!(matches!(err, EngineError::Timeout { timeout_ms: 100 }));
    }
}
