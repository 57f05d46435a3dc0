//! Sample HTTP filter for attack-defense rounds.
//!
//! Flags look like 31 uppercase alphanumerics followed by `=`. When a
//! request matches one of the attack markers, every flag in the response
//! body is rewritten to a decoy before it reaches the attacker (or, with
//! `BLOCK_ALL_EVIL`, the whole flow is killed). The `session` cookie is
//! tracked in `user_attrs` and offending sessions are remembered in
//! persistent state, so a reload never forgets who was caught.

use std::sync::Arc;

use proxad_core::bytes::Bytes;
use proxad_core::{
    Filter, HttpFilterOutput, HttpFlow, HttpReq, HttpResp, StateContainer, Value, declare_filter,
};

const FLAG_LEN: usize = 31;
const FLAG_REPLACEMENT: &[u8] = b"GRAZIEDARIO";
const SESSION_COOKIE: &str = "session";
const ATTACK_MARKERS: &[&[u8]] = &[b"evilbanana"];
/// Kill matching flows outright instead of rewriting flags.
const BLOCK_ALL_EVIL: bool = false;

#[derive(Default)]
struct FlagGuard {
    state: Option<Arc<StateContainer>>,
}

impl Filter for FlagGuard {
    fn state_name(&self) -> &str {
        "flagguard"
    }

    fn attach_state(&mut self, state: Arc<StateContainer>) {
        self.state = Some(state);
    }

    fn http(&self, flow: &mut HttpFlow, req: &HttpReq, resp: &mut HttpResp) -> HttpFilterOutput {
        if let Some(session_id) = find_session_id(req, resp) {
            flow.set_session_id(session_id);
        }

        let evil = ATTACK_MARKERS
            .iter()
            .any(|marker| contains(&req.raw, marker));
        if !evil {
            return HttpFilterOutput::Passthrough;
        }

        if let (Some(state), Some(session_id)) = (&self.state, flow.session_id()) {
            state.set(format!("evil:{session_id}"), Value::Bool(true));
        }
        if BLOCK_ALL_EVIL {
            return HttpFilterOutput::Kill;
        }

        resp.body = censor_flags(&resp.body);
        HttpFilterOutput::Passthrough
    }
}

/// Session id from the response's `Set-Cookie`, falling back to the
/// request's `Cookie`.
fn find_session_id(req: &HttpReq, resp: &HttpResp) -> Option<String> {
    resp.headers
        .get_str("set-cookie")
        .and_then(|h| cookie_value(&h))
        .or_else(|| {
            req.headers
                .get_str("cookie")
                .and_then(|h| cookie_value(&h))
        })
}

fn cookie_value(header: &str) -> Option<String> {
    header.split(';').find_map(|pair| {
        let (name, value) = pair.split_once('=')?;
        (name.trim() == SESSION_COOKIE).then(|| value.trim().to_owned())
    })
}

/// Replace every `[A-Z0-9]{31}=` token in `body`.
fn censor_flags(body: &[u8]) -> Bytes {
    let mut out = Vec::with_capacity(body.len());
    let mut i = 0;
    while i < body.len() {
        if let Some(end) = flag_at(body, i) {
            out.extend_from_slice(FLAG_REPLACEMENT);
            i = end;
        } else {
            out.push(body[i]);
            i += 1;
        }
    }
    out.into()
}

fn flag_at(body: &[u8], start: usize) -> Option<usize> {
    let end = start + FLAG_LEN;
    if end >= body.len() || body[end] != b'=' {
        return None;
    }
    body[start..end]
        .iter()
        .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit())
        .then_some(end + 1)
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

declare_filter!(FlagGuard::default());
