use crate::{
    ack::{Acknowledgement, AcknowledgementLabel, Acknowledgements},
    entity::EntityId,
    error::ConnectivityError,
    headers::DittoHeaders,
    topic::{Action, Channel},
};
use chrono::{DateTime, Utc};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub entity_id: EntityId,
    pub channel: Channel,
    pub action: Action,
    pub path: String,
    pub value: Option<Value>,
    pub headers: DittoHeaders,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommandResponse {
    pub entity_id: EntityId,
    pub channel: Channel,
    pub action: Action,
    pub path: String,
    pub value: Option<Value>,
    pub status: u16,
    pub headers: DittoHeaders,
}

impl CommandResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub entity_id: EntityId,
    pub channel: Channel,
    pub action: Action,
    pub path: String,
    pub value: Option<Value>,
    pub revision: Option<i64>,
    pub timestamp: Option<DateTime<Utc>>,
    pub headers: DittoHeaders,
}

/// Live message to or from a device. A message carrying a status is a response.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageCommand {
    pub entity_id: EntityId,
    pub subject: String,
    pub path: String,
    pub value: Option<Value>,
    pub status: Option<u16>,
    pub headers: DittoHeaders,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchCommand {
    pub action: Action,
    pub subscription_id: Option<String>,
    pub filter: Option<String>,
    pub namespaces: Vec<String>,
    pub fields: Option<String>,
    pub demand: Option<u64>,
    pub headers: DittoHeaders,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ErrorResponse {
    pub entity_id: EntityId,
    pub channel: Channel,
    pub error: ConnectivityError,
    pub headers: DittoHeaders,
}

impl ErrorResponse {
    pub fn new(entity_id: EntityId, error: ConnectivityError, headers: DittoHeaders) -> Self {
        Self {
            entity_id,
            channel: Channel::Twin,
            error,
            headers,
        }
    }
}

/// Internal command, event, response or acknowledgement.
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    Command(Command),
    CommandResponse(CommandResponse),
    Event(Event),
    Message(MessageCommand),
    Acknowledgement(Acknowledgement),
    Acknowledgements(Acknowledgements),
    Search(SearchCommand),
    Error(ErrorResponse),
}

impl Signal {
    pub fn headers(&self) -> &DittoHeaders {
        match self {
            Signal::Command(c) => &c.headers,
            Signal::CommandResponse(r) => &r.headers,
            Signal::Event(e) => &e.headers,
            Signal::Message(m) => &m.headers,
            Signal::Acknowledgement(a) => &a.headers,
            Signal::Acknowledgements(a) => &a.headers,
            Signal::Search(s) => &s.headers,
            Signal::Error(e) => &e.headers,
        }
    }

    pub fn headers_mut(&mut self) -> &mut DittoHeaders {
        match self {
            Signal::Command(c) => &mut c.headers,
            Signal::CommandResponse(r) => &mut r.headers,
            Signal::Event(e) => &mut e.headers,
            Signal::Message(m) => &mut m.headers,
            Signal::Acknowledgement(a) => &mut a.headers,
            Signal::Acknowledgements(a) => &mut a.headers,
            Signal::Search(s) => &mut s.headers,
            Signal::Error(e) => &mut e.headers,
        }
    }

    pub fn with_headers(mut self, headers: DittoHeaders) -> Self {
        *self.headers_mut() = headers;
        self
    }

    /// Search commands address no single entity.
    pub fn entity_id(&self) -> Option<&EntityId> {
        match self {
            Signal::Command(c) => Some(&c.entity_id),
            Signal::CommandResponse(r) => Some(&r.entity_id),
            Signal::Event(e) => Some(&e.entity_id),
            Signal::Message(m) => Some(&m.entity_id),
            Signal::Acknowledgement(a) => Some(&a.entity_id),
            Signal::Acknowledgements(a) => Some(&a.entity_id),
            Signal::Error(e) => Some(&e.entity_id),
            Signal::Search(_) => None,
        }
    }

    pub fn channel(&self) -> Channel {
        match self {
            Signal::Command(c) => c.channel,
            Signal::CommandResponse(r) => r.channel,
            Signal::Event(e) => e.channel,
            Signal::Message(_) => Channel::Live,
            Signal::Error(e) => e.channel,
            Signal::Acknowledgement(_) | Signal::Acknowledgements(_) | Signal::Search(_) => Channel::Twin,
        }
    }

    pub fn type_name(&self) -> String {
        match self {
            Signal::Command(c) => format!("things.commands:{}", c.action),
            Signal::CommandResponse(r) => format!("things.responses:{}", r.action),
            Signal::Event(e) => format!("things.events:{}", e.action),
            Signal::Message(m) if m.status.is_some() => format!("messages.responses:{}", m.subject),
            Signal::Message(m) => format!("messages.commands:{}", m.subject),
            Signal::Acknowledgement(a) => format!("acknowledgement:{}", a.label),
            Signal::Acknowledgements(_) => "acknowledgements".to_string(),
            Signal::Search(s) => format!("thing-search.commands:{}", s.action),
            Signal::Error(e) => format!("errors:{}", e.error.error_code()),
        }
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.headers().correlation_id()
    }

    pub fn is_live_command(&self) -> bool {
        match self {
            Signal::Command(c) => c.channel == Channel::Live,
            Signal::Message(m) => m.status.is_none(),
            _ => false,
        }
    }

    pub fn is_live_command_response(&self) -> bool {
        match self {
            Signal::CommandResponse(r) => r.channel == Channel::Live,
            Signal::Message(m) => m.status.is_some(),
            _ => false,
        }
    }

    pub fn is_search_subscription_creation(&self) -> bool {
        matches!(self, Signal::Search(s) if s.action == Action::Subscribe)
    }

    pub fn is_acknowledgement(&self) -> bool {
        matches!(self, Signal::Acknowledgement(_) | Signal::Acknowledgements(_))
    }

    pub fn is_response(&self) -> bool {
        matches!(
            self,
            Signal::CommandResponse(_) | Signal::Error(_) | Signal::Acknowledgement(_) | Signal::Acknowledgements(_)
        ) || self.is_live_command_response()
    }

    /// Ack labels this signal requests; commands and events only.
    pub fn acknowledgement_requests(&self) -> Result<Vec<AcknowledgementLabel>, ConnectivityError> {
        match self {
            Signal::Command(_) | Signal::Event(_) | Signal::Message(_) if !self.is_response() => {
                self.headers().acknowledgement_requests()
            }
            _ => Ok(Vec::new()),
        }
    }

    /// Signals that need a response collected by an aggregator.
    pub fn is_ack_requesting(&self) -> bool {
        self.headers().is_response_required()
            && self
                .acknowledgement_requests()
                .map(|labels| !labels.is_empty())
                .unwrap_or(false)
    }

    /// The JSON value carried by the signal, if any.
    pub fn value(&self) -> Option<&Value> {
        match self {
            Signal::Command(c) => c.value.as_ref(),
            Signal::CommandResponse(r) => r.value.as_ref(),
            Signal::Event(e) => e.value.as_ref(),
            Signal::Message(m) => m.value.as_ref(),
            Signal::Acknowledgement(a) => a.payload.as_ref(),
            _ => None,
        }
    }

    /// Resource path inside the entity the signal targets.
    pub fn resource_path(&self) -> &str {
        match self {
            Signal::Command(c) => &c.path,
            Signal::CommandResponse(r) => &r.path,
            Signal::Event(e) => &e.path,
            Signal::Message(m) => &m.path,
            _ => "/",
        }
    }
}
