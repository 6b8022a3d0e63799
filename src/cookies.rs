//! Cookie plumbing for the legacy server: `Set-Cookie` extraction, cookie-pair relay and
//! `Cookie` header parsing.
//!
//! HTTP stacks disagree on how repeated `Set-Cookie` headers are exposed: some give a list of
//! values, others one comma-joined string. [`extract_set_cookies`] tries the list first and
//! the joined string second; the first non-empty result wins.

use reqwest::header::{HeaderMap, SET_COOKIE};
use std::collections::HashMap;

/// Two ways of reading `Set-Cookie` off a response.
pub trait SetCookieSource {
    /// One entry per `Set-Cookie` header (multi-value shape).
    fn set_cookie_list(&self) -> Vec<String>;

    /// All `Set-Cookie` headers as a single comma-joined string.
    fn set_cookie_joined(&self) -> Option<String>;
}

impl SetCookieSource for HeaderMap {
    fn set_cookie_list(&self) -> Vec<String> {
        self.get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .map(str::to_string)
            .collect()
    }

    fn set_cookie_joined(&self) -> Option<String> {
        let joined = self.set_cookie_list().join(", ");
        if joined.is_empty() { None } else { Some(joined) }
    }
}

/// Full `Set-Cookie` strings (attributes included), list shape first, joined string second.
pub fn extract_set_cookies<S: SetCookieSource + ?Sized>(source: &S) -> Vec<String> {
    let from_list: Vec<String> = source
        .set_cookie_list()
        .iter()
        .flat_map(|v| split_joined_set_cookie(v))
        .collect();
    if !from_list.is_empty() {
        return from_list;
    }
    source
        .set_cookie_joined()
        .map(|joined| split_joined_set_cookie(&joined))
        .unwrap_or_default()
}

/// Split a comma-joined `Set-Cookie` string back into cookies. Commas inside attribute values
/// (e.g. `Expires=Thu, 01 Jan 2099 ...`) stay with the cookie they belong to.
pub fn split_joined_set_cookie(joined: &str) -> Vec<String> {
    let mut cookies: Vec<String> = Vec::new();
    for piece in joined.split(',') {
        let starts_cookie = piece
            .split(';')
            .next()
            .and_then(|first| first.split_once('='))
            .is_some_and(|(name, _)| {
                let name = name.trim();
                !name.is_empty() && !name.contains(char::is_whitespace)
            });
        match cookies.last_mut() {
            Some(last) if !starts_cookie => {
                last.push(',');
                last.push_str(piece);
            }
            _ => {
                let trimmed = piece.trim();
                if !trimmed.is_empty() {
                    cookies.push(trimmed.to_string());
                }
            }
        }
    }
    cookies
        .into_iter()
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .collect()
}

/// `name=value` part of a `Set-Cookie` string.
pub fn cookie_pair(set_cookie: &str) -> Option<(&str, &str)> {
    let first = set_cookie.split(';').next()?.trim();
    let (name, value) = first.split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Some((name, value.trim()))
}

/// Value of the named cookie among `Set-Cookie` strings. Last occurrence wins; empty values are skipped.
pub fn find_set_cookie_value(set_cookies: &[String], name: &str) -> Option<String> {
    set_cookies
        .iter()
        .filter_map(|c| cookie_pair(c))
        .filter(|(n, v)| *n == name && !v.is_empty())
        .map(|(_, v)| v.to_string())
        .last()
}

/// Relay captured cookies: `a=1; b=2` from the `name=value` parts of `Set-Cookie` strings.
pub fn cookie_header_from_set_cookies(set_cookies: &[String]) -> Option<String> {
    let pairs: Vec<String> = set_cookies
        .iter()
        .filter_map(|c| cookie_pair(c))
        .map(|(n, v)| format!("{}={}", n, v))
        .collect();
    if pairs.is_empty() {
        None
    } else {
        Some(pairs.join("; "))
    }
}

/// Parse a request `Cookie` header (`a=1; b=2`) into a map. Later duplicates win.
pub fn parse_cookie_header(header: &str) -> HashMap<String, String> {
    header
        .split(';')
        .filter_map(|part| {
            let (name, value) = part.split_once('=')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            Some((name.to_string(), value.trim().trim_matches('"').to_string()))
        })
        .collect()
}

/// Find `NAME=value` for the given cookie name anywhere in a raw header string
/// (`Set-Cookie`, joined `Set-Cookie`, or `Cookie`).
pub fn find_named_value(raw: &str, name: &str) -> Option<String> {
    raw.split([';', ','])
        .filter_map(|segment| segment.trim().split_once('='))
        .find(|(n, _)| n.trim() == name)
        .map(|(_, v)| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// `Set-Cookie` value handed to the browser for a relayed cookie.
pub fn browser_cookie(name: &str, value: &str, http_only: bool) -> String {
    if http_only {
        format!("{}={}; Path=/; HttpOnly; SameSite=Lax", name, value)
    } else {
        format!("{}={}; Path=/; SameSite=Lax", name, value)
    }
}

/// `Set-Cookie` value that expires the named cookie in the browser.
pub fn expired_browser_cookie(name: &str) -> String {
    format!("{}=; Path=/; Max-Age=0; SameSite=Lax", name)
}
