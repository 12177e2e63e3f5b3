// Copyright (c) 2026 FlowPro
// SPDX-License-Identifier: AGPL-3.0

//! Topic layout of the bus.
//!
//! Everything lives under the configured namespace:
//!
//! ```text
//! {ns}/channel/{id}            one-way multicast
//! {ns}/call/{operation}        call pattern, requests
//! {ns}/return/{correlation}    call pattern, responses
//! {ns}/identity/{agentId}      retained presence; empty payload = gone
//! ```
//!
//! Channel ids and operations are validated to exclude the topic syntax
//! characters, so parsing by segment is unambiguous.

use uuid::Uuid;

pub fn channel(namespace: &str, id: &str) -> String {
    format!("{namespace}/channel/{id}")
}

pub fn call(namespace: &str, operation: &str) -> String {
    format!("{namespace}/call/{operation}")
}

pub fn call_return(namespace: &str, correlation: Uuid) -> String {
    format!("{namespace}/return/{correlation}")
}

pub fn identity(namespace: &str, agent: Uuid) -> String {
    format!("{namespace}/identity/{agent}")
}

pub fn identity_wildcard(namespace: &str) -> String {
    format!("{namespace}/identity/+")
}

#[derive(Debug, PartialEq, Eq)]
pub enum TopicKind<'a> {
    Channel(&'a str),
    Call(&'a str),
    Return(Uuid),
    Identity(Uuid),
}

/// Classifies an inbound topic. Topics outside the namespace or with an
/// unknown shape yield `None`.
pub fn parse<'a>(namespace: &str, topic: &'a str) -> Option<TopicKind<'a>> {
    let rest = topic.strip_prefix(namespace)?.strip_prefix('/')?;
    let (kind, name) = rest.split_once('/')?;
    match kind {
        "channel" => Some(TopicKind::Channel(name)),
        "call" => Some(TopicKind::Call(name)),
        "return" => name.parse().ok().map(TopicKind::Return),
        "identity" => name.parse().ok().map(TopicKind::Identity),
        _ => None,
    }
}
