//! High-level device sessions: prompt-delimited command execution.
//!
//! A [`Session`] owns an [`Expect`] engine over some transport and drives
//! the full command lifecycle: write the command, then loop on the pattern
//! bank - device errors, questions, pager interrupts, and finally the
//! prompt - collecting output as it goes.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, trace, warn};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::channel::{compile, Expect, ExpectSet, ExpectedMatch};
use crate::error::{Error, Result, SessionError};
use crate::profile::DeviceProfile;
use crate::transport::Streamer;

/// Window for the opportunistic context read after an error-pattern hit.
const ERROR_CONTEXT_WINDOW: Duration = Duration::from_millis(200);

/// Callback asked to answer device questions no per-call answer covered.
pub type QuestionHandler = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Outcome classification of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdStatus {
    /// The prompt returned without any error pattern firing.
    Ok,

    /// An error pattern matched. The command still completed; whether that
    /// is fatal is the caller's decision.
    ErrorDetected,
}

/// An error-pattern hit inside a command's output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedError {
    /// Name of the error pattern, as declared in the profile or options.
    pub pattern: String,

    /// The text the pattern matched.
    pub matched: String,
}

/// Result of one [`Session::cmd`] execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CmdResult {
    /// The command that was executed.
    pub command: String,

    /// Collected output: everything between the command echo and the
    /// closing prompt, with pager tokens excised.
    pub output: Vec<u8>,

    /// The prompt text that terminated the command, trimmed.
    pub prompt: String,

    /// Wall-clock execution time.
    pub elapsed: Duration,

    /// The error-pattern hit, when one fired.
    pub detected_error: Option<DetectedError>,
}

impl CmdResult {
    pub fn status(&self) -> CmdStatus {
        if self.detected_error.is_some() {
            CmdStatus::ErrorDetected
        } else {
            CmdStatus::Ok
        }
    }

    pub fn is_success(&self) -> bool {
        self.detected_error.is_none()
    }

    /// Output as lossy UTF-8.
    pub fn output_lossy(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.output)
    }
}

impl std::fmt::Display for CmdResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.output_lossy())
    }
}

/// Per-call execution options.
#[derive(Clone)]
pub struct CmdOptions {
    /// Override the session's per-read (silence) timeout.
    pub read_timeout: Option<Duration>,

    /// Override the session's overall command timeout.
    pub cmd_timeout: Option<Duration>,

    /// Question answers: `(question regex, answer)` pairs, tried in order.
    /// The keys also join the pattern bank, so a question only these
    /// describe is still caught.
    pub answers: Vec<(String, String)>,

    /// Per-call question handler, consulted after `answers`.
    pub question_handler: Option<QuestionHandler>,

    /// Strip the leading echoed command line from the output.
    pub trim_echo: bool,

    /// The device does not echo input for this command (echo was disabled
    /// or the input is a secret); skip echo trimming and keep the written
    /// bytes out of debug logs.
    pub suppress_echo: bool,

    /// React to pager interrupts. Disable when the command's output can
    /// legitimately contain the pager token.
    pub enable_pager: bool,

    /// Additional named error patterns for this call only.
    pub extra_error_patterns: Vec<(String, String)>,

    /// Expect this prompt instead of the session's (mode changes).
    pub custom_prompt: Option<String>,

    /// Turn an error-pattern hit into `SessionError::DeviceError` instead
    /// of a structured result.
    pub fail_on_device_error: bool,

    /// Cancellation token observed at every suspension point.
    pub cancel: Option<CancellationToken>,
}

impl Default for CmdOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl CmdOptions {
    pub fn new() -> Self {
        Self {
            read_timeout: None,
            cmd_timeout: None,
            answers: Vec::new(),
            question_handler: None,
            trim_echo: true,
            suppress_echo: false,
            enable_pager: true,
            extra_error_patterns: Vec::new(),
            custom_prompt: None,
            fail_on_device_error: false,
            cancel: None,
        }
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    pub fn cmd_timeout(mut self, timeout: Duration) -> Self {
        self.cmd_timeout = Some(timeout);
        self
    }

    /// Add a `(question regex, answer)` pair.
    pub fn answer(mut self, question: impl Into<String>, answer: impl Into<String>) -> Self {
        self.answers.push((question.into(), answer.into()));
        self
    }

    pub fn question_handler(
        mut self,
        handler: impl Fn(&str) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        self.question_handler = Some(Arc::new(handler));
        self
    }

    pub fn trim_echo(mut self, trim: bool) -> Self {
        self.trim_echo = trim;
        self
    }

    pub fn suppress_echo(mut self, suppress: bool) -> Self {
        self.suppress_echo = suppress;
        self
    }

    pub fn enable_pager(mut self, enable: bool) -> Self {
        self.enable_pager = enable;
        self
    }

    pub fn error_pattern(mut self, name: impl Into<String>, pattern: impl Into<String>) -> Self {
        self.extra_error_patterns.push((name.into(), pattern.into()));
        self
    }

    pub fn custom_prompt(mut self, pattern: impl Into<String>) -> Self {
        self.custom_prompt = Some(pattern.into());
        self
    }

    pub fn fail_on_device_error(mut self, fail: bool) -> Self {
        self.fail_on_device_error = fail;
        self
    }

    pub fn cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Builder for [`Session`].
pub struct SessionBuilder {
    profile: DeviceProfile,
    read_timeout: Duration,
    cmd_timeout: Duration,
    question_handler: Option<QuestionHandler>,
    normalize_ansi: bool,
}

impl SessionBuilder {
    pub fn new(profile: DeviceProfile) -> Self {
        Self {
            profile,
            read_timeout: Duration::from_secs(10),
            cmd_timeout: Duration::from_secs(60),
            question_handler: None,
            normalize_ansi: false,
        }
    }

    /// Default per-read (silence) timeout.
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Default overall command timeout.
    pub fn cmd_timeout(mut self, timeout: Duration) -> Self {
        self.cmd_timeout = timeout;
        self
    }

    /// Session-wide question handler.
    pub fn question_handler(
        mut self,
        handler: impl Fn(&str) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        self.question_handler = Some(Arc::new(handler));
        self
    }

    /// Strip ANSI escape sequences from collected output.
    pub fn normalize_ansi(mut self, normalize: bool) -> Self {
        self.normalize_ansi = normalize;
        self
    }

    /// Bind the session to a transport. Validates that every profile
    /// pattern compiles.
    pub fn build(self, streamer: Box<dyn Streamer>) -> Result<Session> {
        compile(&self.profile.prompt_pattern)?;
        for pattern in &self.profile.pager_patterns {
            compile(pattern)?;
        }
        for pattern in self.profile.error_patterns.values() {
            compile(pattern)?;
        }
        for pattern in &self.profile.question_patterns {
            compile(pattern)?;
        }

        let prompt_pattern = self.profile.prompt_pattern.clone();
        Ok(Session {
            expect: Expect::new(streamer),
            profile: self.profile,
            prompt_pattern,
            read_timeout: self.read_timeout,
            cmd_timeout: self.cmd_timeout,
            question_handler: self.question_handler,
            normalize_ansi: self.normalize_ansi,
            connected: false,
            closed: false,
        })
    }
}

/// One authenticated interactive stream with a device.
///
/// Sequential: a session is owned by one task for the duration of each call.
/// A failed command does not poison the session as long as the stream is
/// still at a prompt; reconnecting is the caller's call.
pub struct Session {
    expect: Expect,
    profile: DeviceProfile,
    /// Effective prompt pattern; tightened at connect when the profile's
    /// prompt regex captures a `prompt` group.
    prompt_pattern: String,
    read_timeout: Duration,
    cmd_timeout: Duration,
    question_handler: Option<QuestionHandler>,
    normalize_ansi: bool,
    connected: bool,
    closed: bool,
}

impl Session {
    /// Session with default timeouts. See [`SessionBuilder`] for knobs.
    pub fn new(streamer: Box<dyn Streamer>, profile: DeviceProfile) -> Result<Self> {
        SessionBuilder::new(profile).build(streamer)
    }

    pub fn builder(profile: DeviceProfile) -> SessionBuilder {
        SessionBuilder::new(profile)
    }

    /// The prompt pattern currently in effect.
    pub fn prompt_pattern(&self) -> &str {
        &self.prompt_pattern
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Direct access to the transport (file transfer, tracing).
    pub fn streamer_mut(&mut self) -> &mut dyn Streamer {
        self.expect.streamer_mut()
    }

    /// Open the transport and discover the prompt.
    pub async fn connect(&mut self) -> Result<()> {
        self.connect_with(&CancellationToken::new()).await
    }

    /// [`connect`](Self::connect) observing a cancellation token.
    pub async fn connect_with(&mut self, cancel: &CancellationToken) -> Result<()> {
        if self.connected {
            return Err(SessionError::AlreadyConnected.into());
        }
        if self.closed {
            return Err(SessionError::NotConnected.into());
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(crate::error::ChannelError::Cancelled { buffer: vec![].into() }.into());
            }
            connected = self.expect.streamer_mut().connect() => connected?,
        }

        self.discover_prompt(cancel).await?;
        self.connected = true;

        for command in self.profile.terminal_setup_commands.clone() {
            let opts = CmdOptions::new().cancel(cancel.clone());
            self.cmd_with(&command, opts).await?;
        }

        debug!(
            "session connected; prompt pattern {:?}",
            self.prompt_pattern
        );
        Ok(())
    }

    /// Send a newline and wait for the prompt; record the stable suffix if
    /// the prompt pattern captures one.
    async fn discover_prompt(&mut self, cancel: &CancellationToken) -> Result<()> {
        self.expect.write_all(b"\n").await?;

        let set = ExpectSet::single("prompt", &self.prompt_pattern)?;
        let matched = match self
            .expect
            .expect(&set, self.read_timeout, None, cancel)
            .await
        {
            Ok(m) => m,
            Err(err) if err.is_timeout() => {
                let buffer = err.buffer_snapshot().unwrap_or_default().to_vec();
                return Err(SessionError::PromptNotFound {
                    buffer: buffer.into(),
                }
                .into());
            }
            Err(err) => return Err(err),
        };

        if let Some(suffix) = self.stable_prompt_suffix(&matched)? {
            let tightened = format!(r"{}\s*$", regex::escape(suffix.trim()));
            // A degenerate suffix (all whitespace) would match everywhere.
            if !suffix.trim().is_empty() {
                debug!("prompt tightened to {:?}", tightened);
                self.prompt_pattern = tightened;
            }
        }
        trace!("prompt discovered: {:?}", matched.matched_lossy());
        Ok(())
    }

    /// Extract the `prompt` capture group from the discovery match, if the
    /// profile pattern declares one.
    fn stable_prompt_suffix(&self, matched: &ExpectedMatch) -> Result<Option<String>> {
        let regex = compile(&self.profile.prompt_pattern)?;
        let index = regex
            .capture_names()
            .position(|name| name == Some("prompt"));
        Ok(index
            .and_then(|i| matched.group_lossy(i)))
    }

    /// Execute a command with default options.
    pub async fn cmd(&mut self, command: &str) -> Result<CmdResult> {
        self.cmd_with(command, CmdOptions::new()).await
    }

    /// Execute a command.
    ///
    /// Writes `command` plus newline, then drives the pattern bank until
    /// the prompt returns: error patterns produce an
    /// [`ErrorDetected`](CmdStatus::ErrorDetected) result, questions are
    /// answered and the loop continues, pager interrupts are acknowledged
    /// and excised, the prompt terminates.
    pub async fn cmd_with(&mut self, command: &str, opts: CmdOptions) -> Result<CmdResult> {
        if !self.connected || self.closed {
            return Err(SessionError::NotConnected.into());
        }

        let started = Instant::now();
        let read_timeout = opts.read_timeout.unwrap_or(self.read_timeout);
        let cmd_timeout = opts.cmd_timeout.unwrap_or(self.cmd_timeout);
        let deadline = Instant::now() + cmd_timeout;
        let cancel = opts.cancel.clone().unwrap_or_default();

        let prompt_pattern = opts
            .custom_prompt
            .clone()
            .unwrap_or_else(|| self.prompt_pattern.clone());
        let bank = self
            .build_bank(&opts, &prompt_pattern)
            .map_err(|err| command_error(command, err))?;

        if opts.suppress_echo {
            trace!("cmd: <input suppressed>");
        } else {
            trace!("cmd: {:?}", command);
        }
        let line = format!("{}\n", command);
        self.expect
            .write_all(line.as_bytes())
            .await
            .map_err(|err| command_error(command, err))?;

        let mut output: Vec<u8> = Vec::new();
        let mut strip_residue = false;
        let mut detected: Option<DetectedError> = None;
        let prompt;

        loop {
            let matched = self
                .expect
                .expect(&bank, read_timeout, Some(deadline), &cancel)
                .await
                .map_err(|err| command_error(command, err))?;

            let mut before = matched.before.clone();
            if strip_residue {
                trim_pager_residue(&mut before);
                strip_residue = false;
            }

            let (kind, tag) = split_bank_name(&matched.name);
            match kind {
                "error" => {
                    output.extend_from_slice(&before);
                    output.extend_from_slice(&matched.matched);
                    detected = Some(DetectedError {
                        pattern: tag.to_string(),
                        matched: matched.matched_lossy(),
                    });
                    debug!("cmd {:?}: error pattern {:?} matched", command, tag);
                    prompt = self
                        .collect_error_context(&mut output, &prompt_pattern, read_timeout, &cancel)
                        .await
                        .map_err(|err| command_error(command, err))?;
                    break;
                }
                "question" | "answer" => {
                    output.extend_from_slice(&before);
                    output.extend_from_slice(&matched.matched);
                    let question = matched.matched_lossy();
                    let answer = self
                        .resolve_answer(&opts, kind, tag, &question)
                        .ok_or_else(|| {
                            command_error(
                                command,
                                SessionError::UnansweredQuestion {
                                    question: question.clone(),
                                }
                                .into(),
                            )
                        })?;
                    debug!("cmd {:?}: answering question {:?}", command, question);
                    let reply = format!("{}\n", answer);
                    self.expect
                        .write_all(reply.as_bytes())
                        .await
                        .map_err(|err| command_error(command, err))?;
                }
                "pager" => {
                    output.extend_from_slice(&before);
                    trace!("cmd {:?}: pager interrupt", command);
                    self.expect
                        .write_all(&[self.profile.pager_continue])
                        .await
                        .map_err(|err| command_error(command, err))?;
                    strip_residue = true;
                }
                _ => {
                    // Prompt: the command is complete.
                    output.extend_from_slice(&before);
                    prompt = matched.matched_lossy().trim().to_string();
                    break;
                }
            }
        }

        if opts.trim_echo && !opts.suppress_echo {
            trim_command_echo(&mut output, command);
        }
        if self.normalize_ansi {
            output = strip_ansi_escapes::strip(&output);
        }

        let result = CmdResult {
            command: command.to_string(),
            output,
            prompt,
            elapsed: started.elapsed(),
            detected_error: detected,
        };

        if opts.fail_on_device_error {
            if let Some(ref hit) = result.detected_error {
                return Err(command_error(
                    command,
                    SessionError::DeviceError {
                        pattern: hit.pattern.clone(),
                        output: result.output_lossy().into_owned(),
                    }
                    .into(),
                ));
            }
        }
        Ok(result)
    }

    /// Close the session. The first call closes the transport; later calls
    /// are no-ops.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            debug!("session already closed");
            return Ok(());
        }
        self.closed = true;
        self.connected = false;
        self.expect.close().await
    }

    fn build_bank(&self, opts: &CmdOptions, prompt_pattern: &str) -> Result<ExpectSet> {
        let mut bank = ExpectSet::new();
        for (name, pattern) in &self.profile.error_patterns {
            bank.insert(format!("error:{}", name), pattern)?;
        }
        for (name, pattern) in &opts.extra_error_patterns {
            bank.insert(format!("error:{}", name), pattern)?;
        }
        for (index, (pattern, _)) in opts.answers.iter().enumerate() {
            bank.insert(format!("answer:{}", index), pattern)?;
        }
        for (index, pattern) in self.profile.question_patterns.iter().enumerate() {
            bank.insert(format!("question:{}", index), pattern)?;
        }
        if opts.enable_pager {
            for (index, pattern) in self.profile.pager_patterns.iter().enumerate() {
                bank.insert(format!("pager:{}", index), pattern)?;
            }
        }
        bank.insert("prompt", prompt_pattern)?;
        Ok(bank)
    }

    /// After an error-pattern hit: one opportunistic read for trailing
    /// context, then cut the output at the prompt when it already arrived.
    /// Returns the prompt text when it was seen.
    async fn collect_error_context(
        &mut self,
        output: &mut Vec<u8>,
        prompt_pattern: &str,
        read_timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let window = read_timeout.min(ERROR_CONTEXT_WINDOW);
        let _ = self.expect.read_more(window, cancel).await?;

        let prompt_set = ExpectSet::single("prompt", prompt_pattern)?;
        let buffer = self.expect.buffer_mut();
        if let Some(found) = buffer.scan(&prompt_set) {
            output.extend_from_slice(buffer.peek(found.start));
            let matched = buffer.peek(found.end)[found.start..].to_vec();
            buffer.consume(found.end);
            Ok(String::from_utf8_lossy(&matched).trim().to_string())
        } else {
            let pending = buffer.pending().to_vec();
            output.extend_from_slice(&pending);
            buffer.consume(pending.len());
            Ok(String::new())
        }
    }

    /// Answer lookup order: per-call answers, then the per-call handler,
    /// then the session handler.
    fn resolve_answer(
        &self,
        opts: &CmdOptions,
        kind: &str,
        tag: &str,
        question: &str,
    ) -> Option<String> {
        if kind == "answer" {
            // The matched pattern *is* one of the per-call answer keys.
            if let Some((_, answer)) = tag
                .parse::<usize>()
                .ok()
                .and_then(|index| opts.answers.get(index))
            {
                return Some(answer.clone());
            }
        }
        for (pattern, answer) in &opts.answers {
            match compile(pattern) {
                Ok(regex) if regex.is_match(question.as_bytes()) => {
                    return Some(answer.clone());
                }
                Ok(_) => {}
                Err(_) => warn!("unmatchable answer pattern {:?}", pattern),
            }
        }
        if let Some(handler) = opts.question_handler.as_ref().or(self.question_handler.as_ref()) {
            return handler(question);
        }
        None
    }
}

fn command_error(command: &str, source: Error) -> Error {
    SessionError::Command {
        command: command.to_string(),
        source: Box::new(source),
    }
    .into()
}

fn split_bank_name(name: &str) -> (&str, &str) {
    name.split_once(':').unwrap_or((name, ""))
}

/// Strip the leading echoed line when it equals the command.
fn trim_command_echo(output: &mut Vec<u8>, command: &str) {
    let cmd = command.as_bytes();
    if !output.starts_with(cmd) {
        return;
    }
    let mut end = cmd.len();
    while output.get(end) == Some(&b'\r') {
        end += 1;
    }
    match output.get(end) {
        Some(&b'\n') => {
            output.drain(..=end);
        }
        None => output.clear(),
        Some(_) => {} // first line merely starts with the command; keep it
    }
}

/// Drop the erase sequence a device emits after a pager continuation:
/// carriage returns, backspaces, and space runs that end in another return.
fn trim_pager_residue(chunk: &mut Vec<u8>) {
    let mut start = 0;
    loop {
        match chunk.get(start) {
            Some(&b'\r') | Some(&0x08) | Some(&0x00) => start += 1,
            Some(&b' ') => {
                let run_end = start
                    + chunk[start..]
                        .iter()
                        .take_while(|&&b| b == b' ')
                        .count();
                if chunk.get(run_end) == Some(&b'\r') {
                    start = run_end;
                } else {
                    break;
                }
            }
            _ => break,
        }
    }
    if start > 0 {
        chunk.drain(..start);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn echo_trim_removes_exact_leading_line() {
        let mut out = b"show version\r\nIOS 15.2\n".to_vec();
        trim_command_echo(&mut out, "show version");
        assert_eq!(out, b"IOS 15.2\n");
    }

    #[test]
    fn echo_trim_keeps_non_matching_first_line() {
        let mut out = b"something else\nIOS 15.2\n".to_vec();
        trim_command_echo(&mut out, "show version");
        assert_eq!(out, b"something else\nIOS 15.2\n");
    }

    #[test]
    fn echo_trim_keeps_line_that_only_starts_with_command() {
        let mut out = b"show version detail\nX\n".to_vec();
        trim_command_echo(&mut out, "show version");
        assert_eq!(out, b"show version detail\nX\n");
    }

    #[test]
    fn echo_trim_clears_bare_echo() {
        let mut out = b"reload".to_vec();
        trim_command_echo(&mut out, "reload");
        assert!(out.is_empty());
    }

    #[test]
    fn pager_residue_strips_cr_and_backspaces() {
        let mut chunk = b"\rline3\n".to_vec();
        trim_pager_residue(&mut chunk);
        assert_eq!(chunk, b"line3\n");

        let mut chunk = b"\x08\x08\r        \rline3\n".to_vec();
        trim_pager_residue(&mut chunk);
        assert_eq!(chunk, b"line3\n");
    }

    #[test]
    fn pager_residue_keeps_leading_indentation() {
        // Spaces not followed by a carriage return are real output.
        let mut chunk = b"    indented\n".to_vec();
        trim_pager_residue(&mut chunk);
        assert_eq!(chunk, b"    indented\n");
    }

    #[test]
    fn bank_name_split() {
        assert_eq!(split_bank_name("error:invalid"), ("error", "invalid"));
        assert_eq!(split_bank_name("prompt"), ("prompt", ""));
    }
}
