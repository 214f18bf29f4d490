//! Pod session actions: `exec`, `stdin`, `openLog`, `closeLog`.
//!
//! `exec` and `openLog` validate their params, start a bridge task and answer
//! `Success` at once; the stream itself arrives later as `exec`/`log`
//! envelopes keyed by the caller's `session_id`.

use serde::{Deserialize, Deserializer};
use serde_json::Value;
use tracing::info;

use crate::cluster::{PodTarget, TerminalSize};
use crate::protocol::{decode_params, Code, Response};
use crate::registry::{actions, CommandRegistry};
use crate::sessions::{ExecSessions, LogSessions};

const RESOURCE: &str = "pod";

/// Accepts `24`, `"24"` or nothing; anything unparsable is 0.
fn lenient_u16<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u16, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::Number(n) => n.as_u64().and_then(|n| u16::try_from(n).ok()).unwrap_or(0),
        Value::String(s) => s.trim().parse().unwrap_or(0),
        _ => 0,
    })
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ExecParams {
    name: String,
    namespace: String,
    container: String,
    session_id: String,
    #[serde(deserialize_with = "lenient_u16")]
    rows: u16,
    #[serde(deserialize_with = "lenient_u16")]
    cols: u16,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct StdinParams {
    session_id: String,
    input: String,
    #[serde(deserialize_with = "lenient_u16")]
    width: u16,
    #[serde(deserialize_with = "lenient_u16")]
    height: u16,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct OpenLogParams {
    name: String,
    namespace: String,
    container: String,
    session_id: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CloseLogParams {
    session_id: String,
}

/// The remote command for an interactive shell: export the terminal size,
/// then prefer bash and fall back to sh.
pub fn shell_command(size: TerminalSize) -> Vec<String> {
    vec![
        "/bin/sh".to_string(),
        "-c".to_string(),
        format!(
            "export LINES={}; export COLUMNS={}; TERM=xterm-256color; export TERM; \
             [ -x /bin/bash ] && exec /bin/bash || exec /bin/sh",
            size.rows, size.cols
        ),
    ]
}

fn validate(name: &str, namespace: &str, session_id: &str) -> Option<Response> {
    let msg = if name.is_empty() {
        "Pod name is blank"
    } else if namespace.is_empty() {
        "Namespace is blank"
    } else if session_id.is_empty() {
        "Session id is blank"
    } else {
        return None;
    };
    Some(Response::error(Code::ParamsError, msg))
}

fn target(name: String, namespace: String, container: String) -> PodTarget {
    PodTarget {
        namespace,
        name,
        container: Some(container).filter(|c| !c.is_empty()),
    }
}

#[derive(Clone)]
pub struct PodSessions {
    exec: ExecSessions,
    logs: LogSessions,
}

impl PodSessions {
    pub fn new(exec: ExecSessions, logs: LogSessions) -> Self {
        Self { exec, logs }
    }

    pub fn register(&self, registry: &mut CommandRegistry) {
        let this = self.clone();
        registry.register(RESOURCE, actions::EXEC, move |p| {
            let this = this.clone();
            async move { this.exec(&p) }
        });
        let this = self.clone();
        registry.register(RESOURCE, actions::STDIN, move |p| {
            let this = this.clone();
            async move { this.stdin(&p).await }
        });
        let this = self.clone();
        registry.register(RESOURCE, actions::OPEN_LOG, move |p| {
            let this = this.clone();
            async move { this.open_log(&p) }
        });
        let this = self.clone();
        registry.register(RESOURCE, actions::CLOSE_LOG, move |p| {
            let this = this.clone();
            async move { this.close_log(&p) }
        });
    }

    fn exec(&self, params: &Value) -> Response {
        let params: ExecParams = decode_params(params);
        if let Some(invalid) = validate(&params.name, &params.namespace, &params.session_id) {
            return invalid;
        }
        let size = if params.rows > 0 && params.cols > 0 {
            TerminalSize {
                rows: params.rows,
                cols: params.cols,
            }
        } else {
            TerminalSize::default()
        };
        info!(session_id = %params.session_id, pod = %params.name, "Exec: open requested");
        self.exec.open(
            params.session_id,
            target(params.name, params.namespace, params.container),
            shell_command(size),
            size,
        );
        Response::ok()
    }

    async fn stdin(&self, params: &Value) -> Response {
        let params: StdinParams = decode_params(params);
        let resize = (params.width > 0 && params.height > 0).then_some(TerminalSize {
            rows: params.height,
            cols: params.width,
        });
        match self
            .exec
            .write_stdin(&params.session_id, params.input.into_bytes(), resize)
            .await
        {
            Ok(()) => Response::ok(),
            Err(e) => Response::error(Code::ParamsError, e.to_string()),
        }
    }

    fn open_log(&self, params: &Value) -> Response {
        let params: OpenLogParams = decode_params(params);
        if let Some(invalid) = validate(&params.name, &params.namespace, &params.session_id) {
            return invalid;
        }
        self.logs.open(
            params.session_id,
            target(params.name, params.namespace, params.container),
        );
        Response::ok()
    }

    fn close_log(&self, params: &Value) -> Response {
        let params: CloseLogParams = decode_params(params);
        self.logs.close(&params.session_id);
        Response::ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::testing::FakeCluster;
    use crate::tunnel::Outbound;
    use serde_json::json;
    use std::time::Duration;

    fn sessions(cluster: &std::sync::Arc<FakeCluster>, out: &Outbound) -> PodSessions {
        PodSessions::new(
            ExecSessions::new(cluster.clone(), out.clone()),
            LogSessions::new(cluster.clone(), out.clone(), 100),
        )
    }

    #[test]
    fn terminal_size_accepts_strings_and_numbers() {
        let params: ExecParams = decode_params(&json!({"rows": "40", "cols": 120, "name": "web-0"}));
        assert_eq!((params.rows, params.cols), (40, 120));
        assert_eq!(params.name, "web-0");
        let junk: ExecParams = decode_params(&json!({"rows": "tall", "cols": -3}));
        assert_eq!((junk.rows, junk.cols), (0, 0));
    }

    #[test]
    fn shell_command_exports_size_and_prefers_bash() {
        let cmd = shell_command(TerminalSize { rows: 40, cols: 120 });
        assert_eq!(cmd[..2], ["/bin/sh", "-c"]);
        assert!(cmd[2].contains("export LINES=40; export COLUMNS=120;"));
        assert!(cmd[2].contains("exec /bin/bash || exec /bin/sh"));
    }

    #[tokio::test]
    async fn exec_validates_before_starting() {
        let cluster = FakeCluster::new();
        let out = Outbound::new(8);
        let pod = sessions(&cluster, &out);

        let response = pod.exec(&json!({"namespace": "default", "session_id": "s1"}));
        assert_eq!((response.code, response.msg.as_str()), (Code::ParamsError, "Pod name is blank"));
        let response = pod.exec(&json!({"name": "web-0", "namespace": "default"}));
        assert_eq!(response.msg, "Session id is blank");
        tokio::task::yield_now().await;
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn exec_then_stdin_reaches_the_shell() {
        let cluster = FakeCluster::new();
        let out = Outbound::new(8);
        let pod = sessions(&cluster, &out);

        let response = pod.exec(&json!({
            "name": "web-0", "namespace": "default", "container": "app",
            "session_id": "s1", "rows": "30", "cols": "100"
        }));
        assert!(response.is_success());
        let mut remote = cluster.next_shell().await;
        assert_eq!(remote.size, TerminalSize { rows: 30, cols: 100 });
        assert_eq!(remote.target.container.as_deref(), Some("app"));
        assert!(remote.command[2].contains("LINES=30"));

        let response = pod
            .stdin(&json!({"session_id": "s1", "input": "pwd\n", "width": 90, "height": 20}))
            .await;
        assert!(response.is_success());
        assert_eq!(remote.resizes.recv().await, Some(TerminalSize { rows: 20, cols: 90 }));
        assert_eq!(remote.read_input(4).await, b"pwd\n");
    }

    #[tokio::test]
    async fn stdin_with_mistyped_input_still_finds_the_session() {
        let cluster = FakeCluster::new();
        let pod = sessions(&cluster, &Outbound::new(8));
        assert!(pod
            .exec(&json!({"name": "web-0", "namespace": "default", "session_id": "s1"}))
            .is_success());
        let _remote = cluster.next_shell().await;
        tokio::time::timeout(Duration::from_secs(2), async {
            while !pod.exec.is_open("s1") {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let response = pod.stdin(&json!({"session_id": "s1", "input": 123})).await;
        assert!(response.is_success(), "{response:?}");
    }

    #[tokio::test]
    async fn stdin_for_unknown_session_is_params_error() {
        let cluster = FakeCluster::new();
        let pod = sessions(&cluster, &Outbound::new(4));
        let response = pod.stdin(&json!({"session_id": "ghost", "input": "ls"})).await;
        assert_eq!(response.code, Code::ParamsError);
        assert_eq!(response.msg, "Not found session id");
    }

    #[tokio::test]
    async fn close_log_is_idempotent() {
        let cluster = FakeCluster::new();
        let out = Outbound::new(8);
        let pod = sessions(&cluster, &out);
        assert!(pod.close_log(&json!({"session_id": "never"})).is_success());

        assert!(pod
            .open_log(&json!({"name": "web-0", "namespace": "default", "session_id": "l1"}))
            .is_success());
        let _remote = cluster.next_log().await;
        assert!(pod.close_log(&json!({"session_id": "l1"})).is_success());
        tokio::time::timeout(Duration::from_secs(2), async {
            while pod.logs.is_open("l1") {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(pod.close_log(&json!({"session_id": "l1"})).is_success());
    }
}
