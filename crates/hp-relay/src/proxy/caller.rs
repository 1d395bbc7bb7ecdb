//! Request ownership on the single-request boiler link
//!
//! The boiler answers one request at a time and its replies carry no
//! request id. The dispatcher keeps exactly one request in flight, queues
//! the rest in arrival order, and remembers who asked so replies go back to
//! that caller only.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;

/// Origin of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Caller {
    /// The IGW gateway connection
    Gateway,
    /// A client of the internal command port
    Command,
    /// Queries issued by the relay itself
    Internal,
    /// A caller that went away while its request was in flight; the reply
    /// still completes the request but is discarded
    Detached,
}

impl fmt::Display for Caller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Caller::Gateway => write!(f, "gateway"),
            Caller::Command => write!(f, "command"),
            Caller::Internal => write!(f, "internal"),
            Caller::Detached => write!(f, "detached"),
        }
    }
}

/// One request line and its caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub caller: Caller,
    pub line: Bytes,
}

impl Request {
    pub fn new(caller: Caller, line: Bytes) -> Self {
        Self { caller, line }
    }
}

#[derive(Debug)]
struct InFlight {
    caller: Caller,
    deadline: Instant,
}

/// Single-slot request dispatcher with a FIFO backlog
#[derive(Debug)]
pub struct Dispatcher {
    in_flight: Option<InFlight>,
    pending: VecDeque<Request>,
    response_timeout: Duration,
}

impl Dispatcher {
    pub fn new(response_timeout: Duration) -> Self {
        Self {
            in_flight: None,
            pending: VecDeque::new(),
            response_timeout,
        }
    }

    /// Accept a request. Returns it back if it may be sent right away,
    /// otherwise it waits in the backlog.
    pub fn submit(&mut self, request: Request) -> Option<Request> {
        if self.in_flight.is_some() {
            tracing::debug!(
                "{} request queued behind {:?} ({} waiting)",
                request.caller,
                self.current(),
                self.pending.len() + 1
            );
            self.pending.push_back(request);
            return None;
        }
        self.start(request.caller);
        Some(request)
    }

    /// The in-flight request's reply is complete (or abandoned). Returns the
    /// next request to send, already marked in flight.
    pub fn complete(&mut self) -> Option<Request> {
        self.in_flight = None;
        let next = self.pending.pop_front()?;
        self.start(next.caller);
        Some(next)
    }

    /// Caller of the in-flight request
    pub fn current(&self) -> Option<Caller> {
        self.in_flight.as_ref().map(|flight| flight.caller)
    }

    /// When the in-flight request is given up
    pub fn deadline(&self) -> Option<Instant> {
        self.in_flight.as_ref().map(|flight| flight.deadline)
    }

    /// Drop queued requests of a caller that went away and detach its
    /// in-flight request, if any. Returns the number of queued requests
    /// dropped.
    pub fn forget(&mut self, caller: Caller) -> usize {
        if let Some(flight) = self.in_flight.as_mut().filter(|f| f.caller == caller) {
            flight.caller = Caller::Detached;
        }
        let before = self.pending.len();
        self.pending.retain(|request| request.caller != caller);
        before - self.pending.len()
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    fn start(&mut self, caller: Caller) {
        self.in_flight = Some(InFlight {
            caller,
            deadline: Instant::now() + self.response_timeout,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(caller: Caller, line: &'static str) -> Request {
        Request::new(caller, Bytes::from_static(line.as_bytes()))
    }

    #[test]
    fn test_idle_dispatches_immediately() {
        let mut dispatcher = Dispatcher::new(Duration::from_secs(5));
        let sent = dispatcher.submit(request(Caller::Gateway, "$info\r\n"));

        assert_eq!(sent, Some(request(Caller::Gateway, "$info\r\n")));
        assert_eq!(dispatcher.current(), Some(Caller::Gateway));
        assert!(dispatcher.deadline().is_some());
    }

    #[test]
    fn test_busy_queues_in_order() {
        let mut dispatcher = Dispatcher::new(Duration::from_secs(5));
        dispatcher.submit(request(Caller::Gateway, "$par get 4\r\n"));

        assert!(dispatcher.submit(request(Caller::Command, "$par get 5\r\n")).is_none());
        assert!(dispatcher.submit(request(Caller::Gateway, "$uptime\r\n")).is_none());
        assert_eq!(dispatcher.pending(), 2);

        let next = dispatcher.complete().unwrap();
        assert_eq!(next.caller, Caller::Command);
        assert_eq!(dispatcher.current(), Some(Caller::Command));

        let next = dispatcher.complete().unwrap();
        assert_eq!(next.line.as_ref(), b"$uptime\r\n");

        assert!(dispatcher.complete().is_none());
        assert!(dispatcher.current().is_none());
    }

    #[test]
    fn test_forget_drops_queued_requests() {
        let mut dispatcher = Dispatcher::new(Duration::from_secs(5));
        dispatcher.submit(request(Caller::Gateway, "$info\r\n"));
        dispatcher.submit(request(Caller::Command, "$par get 4\r\n"));
        dispatcher.submit(request(Caller::Command, "$par get 5\r\n"));

        assert_eq!(dispatcher.forget(Caller::Command), 2);
        assert_eq!(dispatcher.pending(), 0);
        assert_eq!(dispatcher.current(), Some(Caller::Gateway));
        assert!(dispatcher.complete().is_none());
    }

    #[test]
    fn test_forget_detaches_in_flight_request() {
        let mut dispatcher = Dispatcher::new(Duration::from_secs(5));
        dispatcher.submit(request(Caller::Command, "$par get 5\r\n"));
        dispatcher.submit(request(Caller::Gateway, "$info\r\n"));

        assert_eq!(dispatcher.forget(Caller::Command), 0);
        assert_eq!(dispatcher.current(), Some(Caller::Detached));
        assert!(dispatcher.deadline().is_some());

        // the detached reply still frees the link for the next request
        let next = dispatcher.complete().unwrap();
        assert_eq!(next.caller, Caller::Gateway);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_uses_response_timeout() {
        let mut dispatcher = Dispatcher::new(Duration::from_millis(500));
        let before = Instant::now();
        dispatcher.submit(request(Caller::Internal, "$par get PR001\r\n"));
        assert_eq!(dispatcher.deadline(), Some(before + Duration::from_millis(500)));
    }
}
