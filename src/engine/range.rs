use chrono_tz::Tz;

use crate::model::*;
use crate::timezone::local_str_to_utc;

/// Effective range of a pair of endpoints: both present, end not before start.
///
/// Half-open sessions (only one endpoint) and inverted ranges have no
/// effective range. They never block and are never blocked.
pub fn derive_range(start: Option<Ms>, end: Option<Ms>) -> Option<Span> {
    match (start, end) {
        (Some(start), Some(end)) => Span::try_new(start, end),
        _ => None,
    }
}

pub fn session_range(session: &Session) -> Option<Span> {
    derive_range(session.start, session.end)
}

/// Range of a form as currently typed. Malformed endpoints count as absent.
pub fn form_range(form: &SessionForm, tz: Tz) -> Option<Span> {
    let start = local_str_to_utc(&form.start_local, tz).ok().flatten();
    let end = local_str_to_utc(&form.end_local, tz).ok().flatten();
    derive_range(start, end)
}

/// Closed-interval overlap: touching endpoints conflict.
pub fn overlaps(a: &Span, b: &Span) -> bool {
    a.overlaps(b)
}
