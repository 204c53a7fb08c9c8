//! Agent runner (design §4.6): single-shot invocation of an external
//! code-generation subprocess, parsing newline-delimited JSON events from
//! its stdout.
//!
//! Grounded in the "other examples" gator-core `claude_code` harness
//! adapter's stream-json line parser (same event-shape switch over a
//! `type` field, same tolerant-skip-malformed-lines behavior) but
//! generalized from that adapter's fixed Claude Code CLI invocation to a
//! configured argv, and narrowed to the three event shapes this harness's
//! subprocess contract recognizes: `system/init`, `assistant`, and
//! `result/success`.

use async_trait::async_trait;
use crate::error::{RalphError, RalphResult};
use serde::{Deserialize, Serialize};
use std::io::Write as _;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

/// The controller depends only on this operation ("run one request, get a
/// response"), not on the subprocess transport (design notes §9) — mirrors
/// the teacher's `council::CouncilMember` trait-object shape so the
/// controller can be driven by a test double in place of a real agent
/// subprocess.
#[async_trait]
pub trait AgentRunnerHandle: Send + Sync {
    async fn run(&self, request: &AgentRequest) -> RalphResult<AgentResponse>;
}

#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub system_prompt: String,
    pub user_prompt: String,
    pub continue_session: bool,
    pub allowed_tools: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentResponse {
    pub session_id: Option<String>,
    pub model: Option<String>,
    pub total_cost_usd: f64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub final_text: String,
}

pub struct AgentRunnerConfig {
    /// argv for the agent subprocess, e.g. `["claude", "-p", "--output-format", "stream-json"]`.
    pub command: Vec<String>,
    pub working_dir: PathBuf,
    /// Echo assistant text lines to this writer as they arrive, if set.
    pub stream_echo: bool,
}

pub struct AgentRunner {
    config: AgentRunnerConfig,
}

impl AgentRunner {
    pub fn new(config: AgentRunnerConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl AgentRunnerHandle for AgentRunner {
    async fn run(&self, request: &AgentRequest) -> RalphResult<AgentResponse> {
        let command = &self.config.command;
        let Some(program) = command.first() else {
            return Err(RalphError::SubprocessSpawn {
                command: String::new(),
                message: "agent command is empty".to_string(),
            });
        };

        let mut cmd = Command::new(program);
        cmd.args(&command[1..])
            .current_dir(&self.config.working_dir)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        if request.continue_session {
            cmd.env("RALPH_CONTINUE_SESSION", "1");
        }
        if !request.allowed_tools.is_empty() {
            cmd.env("RALPH_ALLOWED_TOOLS", request.allowed_tools.join(","));
        }
        cmd.env("RALPH_SYSTEM_PROMPT", &request.system_prompt);

        let command_line = command.join(" ");

        let mut child = cmd.spawn().map_err(|e| RalphError::SubprocessSpawn {
            command: command_line.clone(),
            message: e.to_string(),
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(request.user_prompt.as_bytes())
                .await
                .map_err(RalphError::Io)?;
            stdin.shutdown().await.ok();
        }

        let Some(stdout) = child.stdout.take() else {
            return Err(RalphError::SubprocessSpawn {
                command: command_line,
                message: "stdout pipe unavailable".to_string(),
            });
        };
        let mut lines = BufReader::new(stdout).lines();

        let mut response = AgentResponse::default();
        let mut final_texts: Vec<String> = Vec::new();
        let mut saw_result = false;

        while let Some(line) = lines.next_line().await.map_err(RalphError::Io)? {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match parse_event_line(trimmed) {
                Ok(Some(event)) => {
                    apply_event(event, &mut response, &mut final_texts, &mut saw_result, self.config.stream_echo);
                }
                Ok(None) => {}
                Err(e) => warn!(line = trimmed, error = %e, "skipping malformed agent event line"),
            }
        }

        let status = child.wait().await.map_err(RalphError::Io)?;

        if !status.success() {
            let mut stderr_tail = String::new();
            if let Some(mut stderr) = child.stderr.take() {
                use tokio::io::AsyncReadExt;
                let _ = stderr.read_to_string(&mut stderr_tail).await;
            }
            return Err(RalphError::SubprocessNonzero {
                command: command_line,
                code: status.code(),
                stderr_tail: tail(&stderr_tail, 4096),
            });
        }

        if !saw_result {
            return Err(RalphError::SubprocessNonzero {
                command: command_line,
                code: status.code(),
                stderr_tail: "subprocess exited without a result event".to_string(),
            });
        }

        response.final_text = final_texts.join("\n");
        Ok(response)
    }
}

#[derive(Debug)]
enum AgentEvent {
    Init { session_id: Option<String>, model: Option<String> },
    AssistantText(String),
    Result { text: String, cost: f64, input_tokens: u64, output_tokens: u64 },
}

fn parse_event_line(line: &str) -> Result<Option<AgentEvent>, serde_json::Error> {
    let v: serde_json::Value = serde_json::from_str(line)?;
    let event_type = v.get("type").and_then(|t| t.as_str()).unwrap_or("");

    let event = match event_type {
        "system" => {
            let subtype = v.get("subtype").and_then(|s| s.as_str());
            if subtype != Some("init") {
                debug!(event_type, subtype, "ignoring unrecognized system event subtype");
                return Ok(None);
            }
            Some(AgentEvent::Init {
                session_id: v.get("session_id").and_then(|s| s.as_str()).map(str::to_string),
                model: v.get("model").and_then(|s| s.as_str()).map(str::to_string),
            })
        }
        "assistant" => {
            let mut text = String::new();
            if let Some(parts) = v
                .get("message")
                .and_then(|m| m.get("content"))
                .and_then(|c| c.as_array())
            {
                for part in parts {
                    if part.get("type").and_then(|t| t.as_str()) == Some("text") {
                        if let Some(t) = part.get("text").and_then(|t| t.as_str()) {
                            text.push_str(t);
                        }
                    }
                }
            }
            if text.is_empty() {
                None
            } else {
                Some(AgentEvent::AssistantText(text))
            }
        }
        "result" => {
            let subtype = v.get("subtype").and_then(|s| s.as_str()).unwrap_or("success");
            if subtype != "success" {
                debug!(event_type, subtype, "ignoring non-success result event");
                return Ok(None);
            }
            let text = v.get("result").and_then(|r| r.as_str()).unwrap_or("").to_string();
            let cost = v.get("total_cost_usd").and_then(|c| c.as_f64()).unwrap_or(0.0);
            let input_tokens = v
                .get("usage")
                .and_then(|u| u.get("input_tokens"))
                .and_then(|n| n.as_u64())
                .unwrap_or(0);
            let output_tokens = v
                .get("usage")
                .and_then(|u| u.get("output_tokens"))
                .and_then(|n| n.as_u64())
                .unwrap_or(0);
            Some(AgentEvent::Result {
                text,
                cost,
                input_tokens,
                output_tokens,
            })
        }
        other => {
            debug!(event_type = other, "ignoring unrecognized agent event type");
            None
        }
    };

    Ok(event)
}

fn apply_event(
    event: AgentEvent,
    response: &mut AgentResponse,
    final_texts: &mut Vec<String>,
    saw_result: &mut bool,
    stream_echo: bool,
) {
    match event {
        AgentEvent::Init { session_id, model } => {
            response.session_id = session_id;
            response.model = model;
        }
        AgentEvent::AssistantText(text) => {
            if stream_echo {
                let mut stdout = std::io::stdout();
                let _ = writeln!(stdout, "{text}");
            }
            final_texts.push(text);
        }
        AgentEvent::Result {
            text,
            cost,
            input_tokens,
            output_tokens,
        } => {
            *saw_result = true;
            response.total_cost_usd += cost;
            response.input_tokens += input_tokens;
            response.output_tokens += output_tokens;
            if !text.is_empty() {
                final_texts.push(text);
            }
        }
    }
}

fn tail(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let mut start = s.len() - max_bytes;
    while start < s.len() && !s.is_char_boundary(start) {
        start += 1;
    }
    s[start..].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_script(dir: &std::path::Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        path
    }

    #[tokio::test]
    async fn parses_init_assistant_and_result_events() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(
            dir.path(),
            "agent.sh",
            "#!/bin/sh\n\
             cat >/dev/null\n\
             echo '{\"type\":\"system\",\"subtype\":\"init\",\"session_id\":\"s-1\",\"model\":\"claude-x\"}'\n\
             echo '{\"type\":\"assistant\",\"message\":{\"content\":[{\"type\":\"text\",\"text\":\"working on it\"}]}}'\n\
             echo '{\"type\":\"result\",\"subtype\":\"success\",\"result\":\"done\",\"total_cost_usd\":0.5,\"usage\":{\"input_tokens\":10,\"output_tokens\":20}}'\n",
        );

        let runner = AgentRunner::new(AgentRunnerConfig {
            command: vec![script.to_str().unwrap().to_string()],
            working_dir: dir.path().to_path_buf(),
            stream_echo: false,
        });

        let response = runner
            .run(&AgentRequest {
                system_prompt: "be helpful".into(),
                user_prompt: "do the task".into(),
                continue_session: false,
                allowed_tools: Vec::new(),
            })
            .await
            .unwrap();

        assert_eq!(response.session_id.as_deref(), Some("s-1"));
        assert_eq!(response.model.as_deref(), Some("claude-x"));
        assert_eq!(response.total_cost_usd, 0.5);
        assert_eq!(response.input_tokens, 10);
        assert_eq!(response.output_tokens, 20);
        assert!(response.final_text.contains("working on it"));
        assert!(response.final_text.contains("done"));
    }

    #[tokio::test]
    async fn missing_result_event_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "agent.sh", "#!/bin/sh\ncat >/dev/null\necho '{\"type\":\"assistant\"}'\n");

        let runner = AgentRunner::new(AgentRunnerConfig {
            command: vec![script.to_str().unwrap().to_string()],
            working_dir: dir.path().to_path_buf(),
            stream_echo: false,
        });

        let err = runner
            .run(&AgentRequest {
                system_prompt: String::new(),
                user_prompt: String::new(),
                continue_session: false,
                allowed_tools: Vec::new(),
            })
            .await
            .unwrap_err();

        assert!(matches!(err, RalphError::SubprocessNonzero { .. }));
    }

    #[tokio::test]
    async fn nonzero_exit_surfaces_stderr_tail() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(
            dir.path(),
            "agent.sh",
            "#!/bin/sh\ncat >/dev/null\necho 'boom' 1>&2\nexit 7\n",
        );

        let runner = AgentRunner::new(AgentRunnerConfig {
            command: vec![script.to_str().unwrap().to_string()],
            working_dir: dir.path().to_path_buf(),
            stream_echo: false,
        });

        let err = runner
            .run(&AgentRequest {
                system_prompt: String::new(),
                user_prompt: String::new(),
                continue_session: false,
                allowed_tools: Vec::new(),
            })
            .await
            .unwrap_err();

        match err {
            RalphError::SubprocessNonzero { code, stderr_tail, .. } => {
                assert_eq!(code, Some(7));
                assert!(stderr_tail.contains("boom"));
            }
            other => panic!("expected SubprocessNonzero, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(
            dir.path(),
            "agent.sh",
            "#!/bin/sh\ncat >/dev/null\necho 'not json'\necho '{\"type\":\"result\",\"result\":\"ok\"}'\n",
        );

        let runner = AgentRunner::new(AgentRunnerConfig {
            command: vec![script.to_str().unwrap().to_string()],
            working_dir: dir.path().to_path_buf(),
            stream_echo: false,
        });

        let response = runner
            .run(&AgentRequest {
                system_prompt: String::new(),
                user_prompt: String::new(),
                continue_session: false,
                allowed_tools: Vec::new(),
            })
            .await
            .unwrap();

        assert!(response.final_text.contains("ok"));
    }
}
