//! Line protocol spoken with the control server.
//!
//! A message is a sequence of UTF-8 lines closed by a line holding a single
//! `.`. Lines that consist only of dots are sent with one extra `.` and
//! unescaped on receipt. Payload lines are `KEY: VALUE` or
//! `COMPONENT: KEY: VALUE`.

use thiserror::Error;

use crate::job::JobState;
use crate::job::spec::{JobSpec, KEY_ALGORITHM, KEY_GRAPH, KEY_JOB_ID, KEY_PARSER};
use crate::session::host::HostInfo;
use crate::session::logging::LogRecord;

pub const TERMINATOR: &str = ".";
pub const KEY_SEPARATOR: &str = ": ";

pub const NEW_JOB: &str = "NewJob";
pub const JOB_ACCEPTED: &str = "JobAccepted";
pub const JOB_REFUSED: &str = "JobRefused";
pub const JOB_FAILED: &str = "JobFailed";
pub const JOB_FINISHED: &str = "JobFinished";
pub const JOB_STATE_CHANGE: &str = "JobStateChange";
pub const CANCEL_JOB: &str = "CancelJob";
pub const TERMINATE_WORKER: &str = "TerminateWorker";
pub const RESET_WORKER: &str = "ResetWorker";
pub const PING: &str = "Ping";
pub const PONG: &str = "Pong";
pub const LOGGING: &str = "logging";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("empty message")]
    EmptyMessage,

    #[error("NewJob message is missing '{0}'")]
    MissingKey(&'static str),

    #[error("parameter '{key}' of component '{component}' set twice")]
    DuplicateParameter { component: String, key: String },
}

fn is_dot_line(line: &str) -> bool {
    !line.is_empty() && line.bytes().all(|b| b == b'.')
}

/// Reassembles inbound lines into messages.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    pending: Vec<String>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one line. Returns the completed message when `line` is the
    /// terminator. Empty lines are ignored.
    pub fn push_line(&mut self, line: &str) -> Option<Vec<String>> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            return None;
        }
        if line == TERMINATOR {
            return Some(std::mem::take(&mut self.pending));
        }
        if is_dot_line(line) {
            self.pending.push(line[1..].to_string());
        } else {
            self.pending.push(line.to_string());
        }
        None
    }
}

/// Encodes one logical message, terminator included. Multi-line entries are
/// split into separate lines.
pub fn encode<S: AsRef<str>>(lines: &[S]) -> String {
    let mut out = String::new();
    for line in lines.iter().flat_map(|l| l.as_ref().lines()) {
        out.push_str(line);
        if is_dot_line(line) {
            out.push('.');
        }
        out.push('\n');
    }
    out.push_str(TERMINATOR);
    out.push('\n');
    out
}

/// A message from the control server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    NewJob(JobSpec),
    CancelJob,
    TerminateWorker,
    ResetWorker,
    Ping,
    Pong,
    /// Anything the worker does not act on, with its payload lines.
    Unhandled { token: String, lines: Vec<String> },
}

impl Inbound {
    pub fn parse(mut lines: Vec<String>) -> Result<Self, ProtocolError> {
        if lines.is_empty() {
            return Err(ProtocolError::EmptyMessage);
        }
        let token = lines.remove(0);
        Ok(match token.as_str() {
            NEW_JOB => Inbound::NewJob(parse_new_job(&lines)?),
            CANCEL_JOB => Inbound::CancelJob,
            TERMINATE_WORKER => Inbound::TerminateWorker,
            RESET_WORKER => Inbound::ResetWorker,
            PING => Inbound::Ping,
            PONG => Inbound::Pong,
            _ => Inbound::Unhandled { token, lines },
        })
    }
}

/// Builds a job description from the payload of a `NewJob` message.
///
/// Two-token lines set protocol keys; unknown keys are ignored. Three-token
/// lines set a component parameter, and setting the same one twice is an
/// error.
pub fn parse_new_job(lines: &[String]) -> Result<JobSpec, ProtocolError> {
    let mut spec = JobSpec::default();
    let (mut id, mut algorithm, mut parser, mut graph) = (None, None, None, None);

    for line in lines {
        let tokens: Vec<&str> = line.split(KEY_SEPARATOR).collect();
        match tokens.as_slice() {
            [key, value] => match *key {
                KEY_JOB_ID => id = Some(value.to_string()),
                KEY_ALGORITHM => algorithm = Some(value.to_string()),
                KEY_PARSER => parser = Some(value.to_string()),
                KEY_GRAPH => graph = Some(value.to_string()),
                other => tracing::debug!(key = other, "Ignoring unknown NewJob key"),
            },
            [component, key, value] => {
                let parameters = spec.parameters.entry(component.to_string()).or_default();
                if parameters.contains_key(*key) {
                    return Err(ProtocolError::DuplicateParameter {
                        component: component.to_string(),
                        key: key.to_string(),
                    });
                }
                parameters.insert(key.to_string(), value.to_string());
            }
            _ => tracing::debug!(line = %line, "Ignoring malformed NewJob line"),
        }
    }

    spec.id = id.ok_or(ProtocolError::MissingKey(KEY_JOB_ID))?;
    spec.algorithm = algorithm.ok_or(ProtocolError::MissingKey(KEY_ALGORITHM))?;
    spec.parser = parser.ok_or(ProtocolError::MissingKey(KEY_PARSER))?;
    spec.graph = graph.ok_or(ProtocolError::MissingKey(KEY_GRAPH))?;
    Ok(spec)
}

/// A message to the control server.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Hello(HostInfo),
    JobAccepted,
    JobRefused,
    JobFailed(String),
    JobFinished,
    JobStateChange(JobState),
    Ping,
    Pong,
    Logging(LogRecord),
}

impl Outbound {
    pub fn lines(&self) -> Vec<String> {
        match self {
            Outbound::Hello(host) => vec![
                format!("CPU{KEY_SEPARATOR}{}", host.cpu),
                format!("RAM{KEY_SEPARATOR}{}", host.memory_bytes),
                format!("Name{KEY_SEPARATOR}{}", host.name),
            ],
            Outbound::JobAccepted => vec![JOB_ACCEPTED.to_string()],
            Outbound::JobRefused => vec![JOB_REFUSED.to_string()],
            Outbound::JobFailed(error) => vec![format!("{JOB_FAILED}{KEY_SEPARATOR}{error}")],
            Outbound::JobFinished => vec![JOB_FINISHED.to_string()],
            Outbound::JobStateChange(state) => {
                vec![JOB_STATE_CHANGE.to_string(), state.label().to_string()]
            }
            Outbound::Ping => vec![PING.to_string()],
            Outbound::Pong => vec![PONG.to_string()],
            Outbound::Logging(record) => record.lines(),
        }
    }

    pub fn encode(&self) -> String {
        encode(&self.lines())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|l| l.to_string()).collect()
    }

    fn decode_all(decoder: &mut FrameDecoder, input: &str) -> Vec<Vec<String>> {
        input.lines().filter_map(|l| decoder.push_line(l)).collect()
    }

    #[test]
    fn dot_lines_are_escaped_and_unescaped() {
        let wire = encode(&["JobFailed: boom", "...", "."]);
        assert_eq!(wire, "JobFailed: boom\n....\n..\n.\n");

        let mut decoder = FrameDecoder::new();
        let messages = decode_all(&mut decoder, &wire);
        assert_eq!(messages, vec![lines(&["JobFailed: boom", "...", "."])]);
    }

    #[test]
    fn multi_line_payload_is_split() {
        assert_eq!(encode(&["a\nb"]), "a\nb\n.\n");
    }

    #[test]
    fn empty_lines_are_ignored() {
        let mut decoder = FrameDecoder::new();
        assert_eq!(decoder.push_line("Ping"), None);
        assert_eq!(decoder.push_line(""), None);
        assert_eq!(decoder.push_line("\r"), None);
        assert_eq!(decoder.push_line(".\r"), Some(lines(&["Ping"])));
    }

    #[test]
    fn parses_new_job() {
        let message = lines(&[
            "NewJob",
            "jobid: 42",
            "algorithm: tsp#1.0",
            "parser: dimacs#2.0",
            "graph: g1",
            "algorithm: seed: 7",
            "parser: directed: true",
            "priority: high",
        ]);
        let Inbound::NewJob(spec) = Inbound::parse(message).unwrap() else {
            panic!("expected NewJob");
        };
        assert_eq!(spec.id, "42");
        assert_eq!(spec.algorithm, "tsp#1.0");
        assert_eq!(spec.parser, "dimacs#2.0");
        assert_eq!(spec.graph, "g1");
        assert_eq!(spec.algorithm_parameters().get("seed").map(String::as_str), Some("7"));
        assert_eq!(spec.parser_parameters().get("directed").map(String::as_str), Some("true"));
    }

    #[test]
    fn duplicate_parameter_is_a_violation() {
        let payload = lines(&[
            "jobid: 1",
            "algorithm: tsp#1.0",
            "parser: dimacs#2.0",
            "graph: g1",
            "algorithm: seed: 7",
            "algorithm: seed: 8",
        ]);
        assert_eq!(
            parse_new_job(&payload),
            Err(ProtocolError::DuplicateParameter {
                component: "algorithm".to_string(),
                key: "seed".to_string()
            })
        );
    }

    #[test]
    fn missing_job_id() {
        let payload = lines(&["algorithm: tsp#1.0", "parser: dimacs#2.0", "graph: g1"]);
        assert_eq!(
            parse_new_job(&payload),
            Err(ProtocolError::MissingKey("jobid"))
        );
    }

    #[test]
    fn control_tokens() {
        assert_eq!(Inbound::parse(lines(&["CancelJob"])).unwrap(), Inbound::CancelJob);
        assert_eq!(Inbound::parse(lines(&["Pong"])).unwrap(), Inbound::Pong);
        assert_eq!(
            Inbound::parse(lines(&["RequestBundle", "name: tsp"])).unwrap(),
            Inbound::Unhandled {
                token: "RequestBundle".to_string(),
                lines: lines(&["name: tsp"])
            }
        );
        assert_eq!(Inbound::parse(Vec::new()), Err(ProtocolError::EmptyMessage));
    }

    #[test]
    fn outbound_encoding() {
        assert_eq!(
            Outbound::JobStateChange(JobState::Running).encode(),
            "JobStateChange\nRUNNING\n.\n"
        );
        assert_eq!(
            Outbound::JobFailed("bad input".to_string()).encode(),
            "JobFailed: bad input\n.\n"
        );
        let hello = Outbound::Hello(HostInfo {
            cpu: "4 x x86_64".to_string(),
            memory_bytes: 1024,
            name: "node1".to_string(),
        });
        assert_eq!(hello.encode(), "CPU: 4 x x86_64\nRAM: 1024\nName: node1\n.\n");
    }
}
