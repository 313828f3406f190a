//! STOMP heart-beat negotiation.

use std::time::Duration;

/// Negotiated heart-beat periods for one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Heartbeat {
    /// How often we must send something. `None` when disabled.
    pub send_every: Option<Duration>,
    /// How often the broker promised to send something. `None` when disabled.
    pub expect_every: Option<Duration>,
}

impl Heartbeat {
    /// Header value for our CONNECT frame: `<outgoing-ms>,<incoming-ms>`.
    pub fn client_header(outgoing: Duration, incoming: Duration) -> String {
        format!("{},{}", outgoing.as_millis(), incoming.as_millis())
    }

    /// Combine our settings with the `heart-beat` header of CONNECTED.
    ///
    /// A side is enabled only when both peers agree to it; the period is the
    /// larger of the two values. A missing or unparsable header disables both.
    pub fn negotiate(outgoing: Duration, incoming: Duration, server: Option<&str>) -> Self {
        let Some((server_out, server_in)) = server.and_then(parse_pair) else {
            return Self::default();
        };
        Self {
            send_every: agree(outgoing, server_in),
            expect_every: agree(incoming, server_out),
        }
    }
}

fn parse_pair(raw: &str) -> Option<(Duration, Duration)> {
    let (out, inc) = raw.split_once(',')?;
    let out = out.trim().parse().ok()?;
    let inc = inc.trim().parse().ok()?;
    Some((Duration::from_millis(out), Duration::from_millis(inc)))
}

fn agree(ours: Duration, theirs: Duration) -> Option<Duration> {
    if ours.is_zero() || theirs.is_zero() {
        None
    } else {
        Some(ours.max(theirs))
    }
}
