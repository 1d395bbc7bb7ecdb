//! Stateful decoder for the gateway/boiler dialog
//!
//! The analyser sees every request line on its way to the boiler and every
//! byte the boiler sends back. It keeps one cursor per session:
//!
//! ```text
//! Idle --request--> Awaiting(verb) --reply complete--> Idle
//!                   Awaiting($igw clear) --ack--> SessionEnding
//! ```
//!
//! Replies may be split across reads at any byte. Only terminated lines are
//! classified; the unterminated tail is carried into the next call, so the
//! outcome never depends on where the stream was cut.

use bytes::{Bytes, BytesMut};
use std::time::{Duration, Instant};

use crate::event::{AnalyserEvent, InfoEvent, InfoKey, TrackEvent};
use crate::frame::{decode_latin1, find_line_end, trim_terminator, MAX_LINE_LENGTH};
use crate::heartbeat::{is_heartbeat, FieldMap, HeartbeatTracker};
use crate::request::RequestVerb;

/// Replies the appliance uses to refuse a request
const ERROR_TOKENS: &[&str] = &["$permission denied", "$error", "$unknown command"];

/// `$info` reply fields
const INFO_FIELDS: &[(&str, InfoKey)] = &[
    ("$KT:", InfoKey::Kt),
    ("$SWV:", InfoKey::Swv),
    ("$FWV I/O:", InfoKey::Fwv),
    ("$SN I/O:", InfoKey::SnIo),
    ("$SN BCE:", InfoKey::SnBce),
];

/// Dialog cursor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    /// No request in flight
    Idle,
    /// A request was relayed, its reply is not complete yet
    Awaiting(RequestVerb),
    /// The gateway's session-clear request was acknowledged
    SessionEnding,
}

impl ParseState {
    pub fn is_in_flight(&self) -> bool {
        matches!(self, ParseState::Awaiting(_))
    }
}

/// What the unterminated tail of a response buffer looks like
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseMode {
    /// Buffer ended on a line terminator
    Complete,
    /// Waiting for the rest of a heartbeat frame
    Heartbeat,
    /// Waiting for the rest of a reply line
    Partial,
}

/// Routing class of one complete boiler line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    /// Heartbeat frame, always meant for the gateway
    Heartbeat,
    /// Part of the reply to the in-flight request
    Reply,
    /// Error token replying to the in-flight request
    Error,
    /// Unsolicited output
    Notice,
}

/// One complete boiler line, bytes untouched
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseLine {
    pub kind: LineKind,
    pub bytes: Bytes,
}

/// Result of classifying a response buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseParse {
    /// Unterminated tail to prepend to the next read
    pub remainder: Bytes,
    pub mode: ResponseMode,
    pub state: ParseState,
    /// The boiler confirmed the gateway's login in this buffer
    pub login_completed: bool,
    pub lines: Vec<ResponseLine>,
}

/// Protocol analyser, one per session
#[derive(Debug)]
pub struct Analyser {
    state: ParseState,
    remainder: BytesMut,
    heartbeat: HeartbeatTracker,
    heartbeat_interval: Duration,
    last_heartbeat: Option<Instant>,
    events: Vec<AnalyserEvent>,
}

impl Analyser {
    /// Create an analyser publishing the given heartbeat fields
    pub fn new(fields: FieldMap) -> Self {
        Self {
            state: ParseState::Idle,
            remainder: BytesMut::new(),
            heartbeat: HeartbeatTracker::new(fields),
            heartbeat_interval: Duration::ZERO,
            last_heartbeat: None,
            events: Vec::new(),
        }
    }

    /// Skip heartbeat frames arriving sooner than `interval` after the last
    /// analysed one (frames are still relayed)
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn state(&self) -> ParseState {
        self.state
    }

    /// Return to the start-of-session state
    pub fn reset(&mut self) {
        self.state = ParseState::Idle;
        self.remainder.clear();
        self.heartbeat.reset();
        self.last_heartbeat = None;
        self.events.clear();
    }

    /// Drain events extracted since the last call
    pub fn take_events(&mut self) -> Vec<AnalyserEvent> {
        std::mem::take(&mut self.events)
    }

    /// Give up on the in-flight request
    pub fn abandon_request(&mut self) {
        if let ParseState::Awaiting(verb) = self.state {
            tracing::warn!("no complete reply to {}, abandoning it", verb);
            self.state = ParseState::Idle;
        }
    }

    /// Classify a request line and move to `Awaiting(verb)`
    pub fn parse_request(&mut self, line: &[u8]) -> ParseState {
        for part in line.split(|b| *b == b'\n') {
            let part = trim_terminator(part);
            if part.is_empty() {
                continue;
            }
            let text = decode_latin1(part);
            let (verb, argument) = RequestVerb::classify(&text);
            match verb {
                RequestVerb::LoginKey => self.push_info(InfoKey::Key, argument),
                RequestVerb::IgwSet => self.push_info(InfoKey::Igw, argument),
                RequestVerb::Passthrough => {
                    tracing::warn!("unknown request {:?}, relaying as passthrough", text)
                }
                _ => tracing::debug!("request {} detected", verb),
            }
            if self.state != ParseState::SessionEnding {
                self.state = ParseState::Awaiting(verb);
            }
        }
        self.state
    }

    /// Feed raw boiler bytes, using and updating the analyser's own cursor
    /// and carried remainder
    pub fn feed_response(&mut self, data: &[u8]) -> ResponseParse {
        self.remainder.extend_from_slice(data);
        let buffer = self.remainder.split().freeze();

        let mut parse = self.parse_response_buffer(&buffer, self.state);
        self.state = parse.state;

        if parse.remainder.len() > MAX_LINE_LENGTH {
            tracing::warn!(
                "{} bytes without line terminator, relaying unclassified",
                parse.remainder.len()
            );
            parse.lines.push(ResponseLine {
                kind: LineKind::Reply,
                bytes: std::mem::take(&mut parse.remainder),
            });
            parse.mode = ResponseMode::Complete;
        }
        self.remainder.extend_from_slice(&parse.remainder);
        parse
    }

    /// Classify every complete line of `buffer` starting from `prior`.
    ///
    /// Pure with respect to the dialog cursor: the caller decides whether to
    /// adopt the returned state and remainder.
    pub fn parse_response_buffer(&mut self, buffer: &[u8], prior: ParseState) -> ResponseParse {
        let mut state = prior;
        let mut login_completed = false;
        let mut lines = Vec::new();
        let mut offset = 0;

        while let Some(len) = find_line_end(&buffer[offset..]) {
            let raw = &buffer[offset..offset + len];
            offset += len;
            let kind = self.classify_line(raw, &mut state, &mut login_completed);
            lines.push(ResponseLine {
                kind,
                bytes: Bytes::copy_from_slice(raw),
            });
        }

        let tail = &buffer[offset..];
        let mode = if tail.is_empty() {
            ResponseMode::Complete
        } else if is_heartbeat(tail) {
            ResponseMode::Heartbeat
        } else {
            ResponseMode::Partial
        };

        ResponseParse {
            remainder: Bytes::copy_from_slice(tail),
            mode,
            state,
            login_completed,
            lines,
        }
    }

    /// Decode one heartbeat frame and queue the changed fields
    pub fn analyse_telemetry_line(&mut self, line: &[u8]) {
        let now = Instant::now();
        if let Some(last) = self.last_heartbeat {
            if now.duration_since(last) < self.heartbeat_interval {
                return;
            }
        }
        self.last_heartbeat = Some(now);

        match self.heartbeat.analyse(line) {
            Ok(changed) => self
                .events
                .extend(changed.into_iter().map(AnalyserEvent::Info)),
            Err(e) => tracing::debug!("heartbeat skipped: {}", e),
        }
    }

    fn classify_line(
        &mut self,
        raw: &[u8],
        state: &mut ParseState,
        login_completed: &mut bool,
    ) -> LineKind {
        let line = trim_terminator(raw);
        if is_heartbeat(line) {
            self.analyse_telemetry_line(line);
            return LineKind::Heartbeat;
        }
        let text = decode_latin1(line);
        tracing::trace!("response line {:?} in {:?}", text, state);

        if let Some(track) = TrackEvent::parse(&text) {
            tracing::info!(
                "parameter {} ({}) changed to {}",
                track.parameter,
                track.name,
                track.value
            );
            self.events.push(AnalyserEvent::Track(track));
        }

        if *state != ParseState::Awaiting(RequestVerb::ErrAct) && is_error_token(&text) {
            tracing::warn!("appliance refused request ({:?}): {}", state, text);
            self.push_info(InfoKey::ApplianceError, text.trim_start_matches('$'));
            if state.is_in_flight() {
                *state = ParseState::Idle;
                return LineKind::Error;
            }
            return LineKind::Notice;
        }

        match *state {
            ParseState::Awaiting(verb) => {
                if let Some(next) = self.advance(verb, &text, login_completed) {
                    *state = next;
                }
                LineKind::Reply
            }
            ParseState::Idle | ParseState::SessionEnding => {
                if !text.is_empty() {
                    tracing::debug!("unsolicited boiler line {:?}", text);
                }
                LineKind::Notice
            }
        }
    }

    /// Apply one reply line to the in-flight `verb`; returns the next state
    /// once the reply is complete
    fn advance(
        &mut self,
        verb: RequestVerb,
        text: &str,
        login_completed: &mut bool,
    ) -> Option<ParseState> {
        use RequestVerb::*;

        let done = match verb {
            LoginToken => {
                self.push_info(InfoKey::Token, text.trim_start_matches('$'));
                true
            }
            LoginKey => {
                if text.contains("zclient login") {
                    tracing::info!("gateway login accepted by boiler");
                    *login_completed = true;
                }
                text.starts_with("$ack")
            }
            ApiVersion => self.dollar_value(InfoKey::Api, text),
            SetKomm => {
                if text.contains("ack") {
                    let value = text.trim_start_matches('$').trim_end_matches("ack").trim();
                    self.push_info(InfoKey::SetKomm, value);
                    true
                } else {
                    false
                }
            }
            AsnrGet => self.dollar_value(InfoKey::Asnr, text),
            IgwSet | DhcpRenew => text.contains("ack"),
            IgwClear => {
                if text.contains("ack") {
                    tracing::info!("gateway session clear acknowledged");
                    return Some(ParseState::SessionEnding);
                }
                false
            }
            DaqStop => text.contains("daq stopped"),
            DaqStart => text.contains("daq started"),
            LoggingDisable => text.contains("logging disabled"),
            LoggingEnable => text.contains("logging enabled"),
            // acquisition description is relayed but not decoded
            DaqDesc => text.ends_with(">>"),
            BootVersion => match text.strip_prefix("$V") {
                Some(version) => {
                    self.push_info(InfoKey::Boot, version);
                    true
                }
                None => false,
            },
            Info => {
                for (prefix, key) in INFO_FIELDS {
                    if let Some(value) = text.strip_prefix(prefix) {
                        self.push_info(key.clone(), value.trim());
                    }
                }
                text.starts_with("$SN BCE:")
            }
            Uptime => self.dollar_value(InfoKey::Uptime, text),
            RtcGet => self.dollar_value(InfoKey::Rtc, text),
            ParGetChanged => {
                if text == "$--" {
                    true
                } else {
                    if let Some(record) = text.strip_prefix('$') {
                        self.push_info(InfoKey::Parameter, record);
                    }
                    false
                }
            }
            ParGet | ParGetAll => self.dollar_value(InfoKey::Parameter, text),
            ParSet => text.starts_with("$ack"),
            ErrAct => {
                self.push_info(InfoKey::ErrAct, text.trim_start_matches('$'));
                true
            }
            Passthrough => {
                tracing::warn!("reply to passthrough request: {:?}", text);
                true
            }
        };

        done.then_some(ParseState::Idle)
    }

    /// `$<value>` reply carrying a single value
    fn dollar_value(&mut self, key: InfoKey, text: &str) -> bool {
        match text.strip_prefix('$') {
            Some(value) => {
                self.push_info(key, value);
                true
            }
            None => false,
        }
    }

    fn push_info(&mut self, key: InfoKey, value: &str) {
        tracing::debug!("extracted {}={}", key, value);
        self.events
            .push(AnalyserEvent::Info(InfoEvent::new(key, value)));
    }
}

impl Default for Analyser {
    fn default() -> Self {
        Self::new(FieldMap::default())
    }
}

fn is_error_token(text: &str) -> bool {
    let lower = text.to_ascii_lowercase();
    ERROR_TOKENS.iter().any(|token| lower.starts_with(token))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(events: &[AnalyserEvent], key: InfoKey) -> Option<String> {
        events.iter().find_map(|event| match event {
            AnalyserEvent::Info(info) if info.key == key => Some(info.value.clone()),
            _ => None,
        })
    }

    #[test]
    fn test_request_moves_to_awaiting() {
        let mut analyser = Analyser::default();
        let state = analyser.parse_request(b"$par get PR001\r\n");
        assert_eq!(state, ParseState::Awaiting(RequestVerb::ParGet));
    }

    #[test]
    fn test_login_key_extracted_from_request() {
        let mut analyser = Analyser::default();
        analyser.parse_request(b"$login key AAAABBBB\r\n");
        let events = analyser.take_events();
        assert_eq!(info(&events, InfoKey::Key).as_deref(), Some("AAAABBBB"));
    }

    #[test]
    fn test_login_key_completes_login() {
        let mut analyser = Analyser::default();
        analyser.parse_request(b"$login key AAAABBBB\r\n");

        let parse = analyser.feed_response(b"zclient login (9999)\r\n$ack\r\n");
        assert!(parse.login_completed);
        assert_eq!(parse.state, ParseState::Idle);
        assert_eq!(parse.lines.len(), 2);
        assert!(parse.lines.iter().all(|l| l.kind == LineKind::Reply));
    }

    #[test]
    fn test_partial_reply_waits_for_terminator() {
        let mut analyser = Analyser::default();
        analyser.parse_request(b"$apiversion\r\n");

        let parse = analyser.feed_response(b"$1.0");
        assert!(parse.lines.is_empty());
        assert_eq!(parse.mode, ResponseMode::Partial);
        assert_eq!(parse.state, ParseState::Awaiting(RequestVerb::ApiVersion));

        let parse = analyser.feed_response(b".1\r\n");
        assert_eq!(parse.mode, ResponseMode::Complete);
        assert_eq!(parse.state, ParseState::Idle);
        assert_eq!(parse.lines[0].bytes.as_ref(), b"$1.0.1\r\n");
        assert_eq!(
            info(&analyser.take_events(), InfoKey::Api).as_deref(),
            Some("1.0.1")
        );
    }

    #[test]
    fn test_session_clear_ack_ends_session() {
        let mut analyser = Analyser::default();
        analyser.parse_request(b"$igw clear\r\n");
        let parse = analyser.feed_response(b"$ack\r\n");
        assert_eq!(parse.state, ParseState::SessionEnding);

        // terminal for the rest of the session
        assert_eq!(analyser.parse_request(b"$info\r\n"), ParseState::SessionEnding);
    }

    #[test]
    fn test_info_reply_fields() {
        let mut analyser = Analyser::default();
        analyser.parse_request(b"$info\r\n");
        let parse = analyser.feed_response(
            b"$KT: 'Nano-PK 32'\r\n$SWV: 'V14.0n3'\r\n$FWV I/O: 'V1.2.3'\r\n$SN I/O: '111'\r\n",
        );
        assert!(parse.state.is_in_flight());

        let parse = analyser.feed_response(b"$SN BCE: '222'\r\n");
        assert_eq!(parse.state, ParseState::Idle);

        let events = analyser.take_events();
        assert_eq!(info(&events, InfoKey::Kt).as_deref(), Some("'Nano-PK 32'"));
        assert_eq!(info(&events, InfoKey::Fwv).as_deref(), Some("'V1.2.3'"));
        assert_eq!(info(&events, InfoKey::SnBce).as_deref(), Some("'222'"));
    }

    #[test]
    fn test_par_set_tracks_change() {
        let mut analyser = Analyser::default();
        analyser.parse_request(b"$par set \"PR001;6;1\"\r\n");
        let parse = analyser.feed_response(
            b"zPa A: PR001 (Mode) = Ballon\r\nzPa N: PR001 (Mode) = Arr\r\nzParamter PR001 per APP verstellt\r\n$ack\r\n",
        );
        assert_eq!(parse.state, ParseState::Idle);

        let events = analyser.take_events();
        assert_eq!(
            events,
            vec![AnalyserEvent::Track(TrackEvent {
                parameter: "PR001".into(),
                name: "Mode".into(),
                value: "Arr".into(),
            })]
        );
    }

    #[test]
    fn test_panel_change_is_notice_and_tracked() {
        let mut analyser = Analyser::default();
        let parse = analyser.feed_response(b"zPa N: 4 (Temp. ambiante jour) = 20.0\r\n");
        assert_eq!(parse.lines[0].kind, LineKind::Notice);
        assert!(matches!(analyser.take_events()[0], AnalyserEvent::Track(_)));
    }

    #[test]
    fn test_permission_denied_is_error() {
        let mut analyser = Analyser::default();
        analyser.parse_request(b"$par get 4\r\n");
        let parse = analyser.feed_response(b"$permission denied\r\n");

        assert_eq!(parse.lines[0].kind, LineKind::Error);
        assert_eq!(parse.state, ParseState::Idle);
        let events = analyser.take_events();
        assert_eq!(
            info(&events, InfoKey::ApplianceError).as_deref(),
            Some("permission denied")
        );
        assert!(info(&events, InfoKey::Parameter).is_none());
    }

    #[test]
    fn test_erract_no_errors_is_not_error_token() {
        let mut analyser = Analyser::default();
        analyser.parse_request(b"$erract\r\n");
        let parse = analyser.feed_response(b"$no errors\r\n");
        assert_eq!(parse.lines[0].kind, LineKind::Reply);
        assert_eq!(
            info(&analyser.take_events(), InfoKey::ErrAct).as_deref(),
            Some("no errors")
        );
    }

    #[test]
    fn test_heartbeat_interleaved_with_reply() {
        let mut analyser = Analyser::default();
        analyser.parse_request(b"$uptime\r\n");
        let parse = analyser.feed_response(b"pm 7 6.3 7.0 65.2\r\n$123456\r\n");

        assert_eq!(parse.lines[0].kind, LineKind::Heartbeat);
        assert_eq!(parse.lines[1].kind, LineKind::Reply);
        assert_eq!(parse.state, ParseState::Idle);

        let events = analyser.take_events();
        assert_eq!(
            info(&events, InfoKey::Field("boiler_temp".into())).as_deref(),
            Some("65.2")
        );
        assert_eq!(info(&events, InfoKey::Uptime).as_deref(), Some("123456"));
    }

    #[test]
    fn test_partial_heartbeat_mode() {
        let mut analyser = Analyser::default();
        let parse = analyser.feed_response(b"pm 7 6.3");
        assert_eq!(parse.mode, ResponseMode::Heartbeat);
        assert_eq!(parse.remainder.as_ref(), b"pm 7 6.3");
    }

    #[test]
    fn test_daq_desc_skipped_until_end_marker() {
        let mut analyser = Analyser::default();
        analyser.parse_request(b"$daq desc\r\n");
        let parse = analyser.feed_response(b"$<<<DAQPRJ>\r\n<ANALOG>...\r\n");
        assert!(parse.state.is_in_flight());
        let parse = analyser.feed_response(b"</DAQPRJ>>>\r\n");
        assert_eq!(parse.state, ParseState::Idle);
        assert!(analyser.take_events().is_empty());
    }

    #[test]
    fn test_passthrough_completes_on_first_line() {
        let mut analyser = Analyser::default();
        assert_eq!(
            analyser.parse_request(b"$frobnicate\r\n"),
            ParseState::Awaiting(RequestVerb::Passthrough)
        );
        let parse = analyser.feed_response(b"$whatever\r\n");
        assert_eq!(parse.state, ParseState::Idle);
    }

    #[test]
    fn test_abandon_request() {
        let mut analyser = Analyser::default();
        analyser.parse_request(b"$rtc get\r\n");
        analyser.abandon_request();
        assert_eq!(analyser.state(), ParseState::Idle);
    }

    /// Feeding a reply in two pieces, cut anywhere, must match feeding it whole
    #[test]
    fn test_response_parsing_is_restartable() {
        let reply: &[u8] =
            b"zclient login (9999)\r\npm 7 6.3 7.0 65.2\r\n$ack\r\nzPa N: PR001 (Mode) = Arr\r\n$par";

        let mut whole = Analyser::default();
        whole.parse_request(b"$login key ABCD\r\n");
        whole.take_events();
        let expected = whole.feed_response(reply);
        let expected_events = whole.take_events();

        for cut in 0..=reply.len() {
            let mut split = Analyser::default();
            split.parse_request(b"$login key ABCD\r\n");
            split.take_events();

            let first = split.feed_response(&reply[..cut]);
            let second = split.feed_response(&reply[cut..]);

            let mut lines = first.lines.clone();
            lines.extend(second.lines.clone());

            assert_eq!(lines, expected.lines, "lines differ at cut {}", cut);
            assert_eq!(second.state, expected.state, "state differs at cut {}", cut);
            assert_eq!(second.remainder, expected.remainder, "remainder differs at cut {}", cut);
            assert_eq!(second.mode, expected.mode, "mode differs at cut {}", cut);
            assert_eq!(
                first.login_completed || second.login_completed,
                expected.login_completed
            );
            assert_eq!(split.take_events(), expected_events, "events differ at cut {}", cut);
        }
    }
}
