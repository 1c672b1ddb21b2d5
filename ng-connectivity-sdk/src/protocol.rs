use crate::{
    ack::{Acknowledgement, AcknowledgementLabel, Acknowledgements},
    adaptable::Adaptable,
    error::ConnectivityError,
    signal::{Command, CommandResponse, ErrorResponse, Event, MessageCommand, SearchCommand, Signal},
    topic::{Action, Channel, Criterion, TopicPath},
};
use serde_json::{Map, Value};

/// Converts between signals and their protocol envelope.
pub trait ProtocolAdapter: Send + Sync {
    fn to_adaptable(&self, signal: &Signal) -> Result<Adaptable, ConnectivityError>;

    fn from_adaptable(&self, adaptable: &Adaptable) -> Result<Signal, ConnectivityError>;
}

/// The Ditto protocol mapping of signals.
#[derive(Debug, Default, Clone, Copy)]
pub struct DittoProtocolAdapter;

impl DittoProtocolAdapter {
    pub fn new() -> Self {
        Self
    }
}

impl ProtocolAdapter for DittoProtocolAdapter {
    fn to_adaptable(&self, signal: &Signal) -> Result<Adaptable, ConnectivityError> {
        let adaptable = match signal {
            Signal::Command(c) => {
                let topic = TopicPath::new(&c.entity_id, c.channel, Criterion::Commands).with_action(c.action);
                let mut a = Adaptable::new(topic, &c.path).with_headers(c.headers.clone());
                a.value = c.value.clone();
                a
            }
            Signal::CommandResponse(r) => {
                let topic = TopicPath::new(&r.entity_id, r.channel, Criterion::Commands).with_action(r.action);
                let mut a = Adaptable::new(topic, &r.path)
                    .with_headers(r.headers.clone())
                    .with_status(r.status);
                a.value = r.value.clone();
                a
            }
            Signal::Event(e) => {
                let topic = TopicPath::new(&e.entity_id, e.channel, Criterion::Events).with_action(e.action);
                let mut a = Adaptable::new(topic, &e.path).with_headers(e.headers.clone());
                a.value = e.value.clone();
                a.revision = e.revision;
                a.timestamp = e.timestamp;
                a
            }
            Signal::Message(m) => {
                let topic = TopicPath::new(&m.entity_id, Channel::Live, Criterion::Messages).with_subject(&m.subject);
                let mut a = Adaptable::new(topic, &m.path).with_headers(m.headers.clone());
                a.value = m.value.clone();
                a.status = m.status;
                a
            }
            Signal::Acknowledgement(ack) => {
                let topic =
                    TopicPath::new(&ack.entity_id, Channel::Twin, Criterion::Acks).with_subject(ack.label.as_str());
                let mut a = Adaptable::new(topic, "/")
                    .with_headers(ack.headers.clone())
                    .with_status(ack.status);
                a.value = ack.payload.clone();
                a
            }
            Signal::Acknowledgements(acks) => {
                let topic = TopicPath::new(&acks.entity_id, Channel::Twin, Criterion::Acks);
                Adaptable::new(topic, "/")
                    .with_headers(acks.headers.clone())
                    .with_status(acks.status())
                    .with_value(acks.entries_json())
            }
            Signal::Search(s) => {
                let mut value = Map::new();
                if let Some(id) = &s.subscription_id {
                    value.insert("subscriptionId".into(), Value::String(id.clone()));
                }
                if let Some(filter) = &s.filter {
                    value.insert("filter".into(), Value::String(filter.clone()));
                }
                if !s.namespaces.is_empty() {
                    value.insert("namespaces".into(), Value::from(s.namespaces.clone()));
                }
                if let Some(fields) = &s.fields {
                    value.insert("fields".into(), Value::String(fields.clone()));
                }
                if let Some(demand) = s.demand {
                    value.insert("demand".into(), Value::from(demand));
                }
                Adaptable::new(TopicPath::search(s.action), "/")
                    .with_headers(s.headers.clone())
                    .with_value(Value::Object(value))
            }
            Signal::Error(e) => {
                let topic = TopicPath::new(&e.entity_id, e.channel, Criterion::Errors);
                let status = e.error.status();
                let mut value = Map::new();
                value.insert("status".into(), Value::from(status));
                value.insert("error".into(), Value::String(e.error.error_code().to_string()));
                value.insert("message".into(), Value::String(e.error.to_string()));
                if let Some(description) = e.error.description() {
                    value.insert("description".into(), Value::String(description));
                }
                Adaptable::new(topic, "/")
                    .with_headers(e.headers.clone())
                    .with_status(status)
                    .with_value(Value::Object(value))
            }
        };
        Ok(adaptable)
    }

    fn from_adaptable(&self, adaptable: &Adaptable) -> Result<Signal, ConnectivityError> {
        let topic = &adaptable.topic;
        let entity_id = topic.entity_id();
        let headers = adaptable.headers.clone();
        let require_action = || {
            topic
                .action
                .ok_or_else(|| ConnectivityError::protocol(format!("topic '{topic}' has no action")))
        };
        let signal = match topic.criterion {
            Criterion::Commands => {
                let action = require_action()?;
                match adaptable.status {
                    Some(status) => Signal::CommandResponse(CommandResponse {
                        entity_id,
                        channel: topic.channel,
                        action,
                        path: adaptable.path.clone(),
                        value: adaptable.value.clone(),
                        status,
                        headers,
                    }),
                    None => {
                        if matches!(action, Action::Modify | Action::Create | Action::Merge)
                            && adaptable.value.is_none()
                        {
                            return Err(ConnectivityError::protocol(format!(
                                "command '{action}' requires a value"
                            )));
                        }
                        Signal::Command(Command {
                            entity_id,
                            channel: topic.channel,
                            action,
                            path: adaptable.path.clone(),
                            value: adaptable.value.clone(),
                            headers,
                        })
                    }
                }
            }
            Criterion::Events => Signal::Event(Event {
                entity_id,
                channel: topic.channel,
                action: require_action()?,
                path: adaptable.path.clone(),
                value: adaptable.value.clone(),
                revision: adaptable.revision,
                timestamp: adaptable.timestamp,
                headers,
            }),
            Criterion::Messages => Signal::Message(MessageCommand {
                entity_id,
                subject: topic.subject.clone().unwrap_or_default(),
                path: adaptable.path.clone(),
                value: adaptable.value.clone(),
                status: adaptable.status,
                headers,
            }),
            Criterion::Acks => match &topic.subject {
                Some(label) => {
                    let status = adaptable
                        .status
                        .ok_or_else(|| ConnectivityError::protocol("acknowledgement requires a status"))?;
                    let mut ack = Acknowledgement::new(AcknowledgementLabel::parse(label)?, entity_id, status, headers);
                    ack.payload = adaptable.value.clone();
                    Signal::Acknowledgement(ack)
                }
                None => {
                    let value = adaptable.value.clone().unwrap_or_else(|| Value::Object(Map::new()));
                    Signal::Acknowledgements(Acknowledgements::from_entries_json(&entity_id, &value, headers)?)
                }
            },
            Criterion::Search => {
                let value = adaptable.value.clone().unwrap_or_else(|| Value::Object(Map::new()));
                let str_field = |key: &str| value.get(key).and_then(Value::as_str).map(String::from);
                let namespaces = value
                    .get("namespaces")
                    .and_then(Value::as_array)
                    .map(|a| a.iter().filter_map(Value::as_str).map(String::from).collect())
                    .unwrap_or_default();
                Signal::Search(SearchCommand {
                    action: require_action()?,
                    subscription_id: str_field("subscriptionId"),
                    filter: str_field("filter"),
                    namespaces,
                    fields: str_field("fields"),
                    demand: value.get("demand").and_then(Value::as_u64),
                    headers,
                })
            }
            Criterion::Errors => {
                let value = adaptable.value.clone().unwrap_or(Value::Null);
                let status = adaptable
                    .status
                    .or_else(|| value.get("status").and_then(Value::as_u64).map(|s| s as u16))
                    .unwrap_or(500);
                let text = |key: &str| value.get(key).and_then(Value::as_str).map(String::from);
                let error = ConnectivityError::Remote {
                    error_code: text("error").unwrap_or_else(|| "unknown.error".to_string()),
                    status,
                    message: text("message").unwrap_or_default(),
                    description: text("description"),
                };
                Signal::Error(ErrorResponse {
                    entity_id,
                    channel: topic.channel,
                    error,
                    headers,
                })
            }
            Criterion::Announcements => {
                return Err(ConnectivityError::protocol("announcements cannot be converted into signals"));
            }
        };
        Ok(signal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{entity::EntityId, headers::DittoHeaders};
    use serde_json::json;

    fn roundtrip(signal: Signal) {
        let adapter = DittoProtocolAdapter::new();
        let adaptable = adapter.to_adaptable(&signal).unwrap();
        let json = adaptable.to_json();
        let parsed = Adaptable::from_json(&json).unwrap();
        assert_eq!(adapter.from_adaptable(&parsed).unwrap(), signal);
    }

    #[test]
    fn signals_survive_the_json_envelope() {
        let headers = DittoHeaders::new().with_correlation_id("c-1");
        let id = EntityId::thing("org.acme", "lamp");
        roundtrip(Signal::Command(Command {
            entity_id: id.clone(),
            channel: Channel::Twin,
            action: Action::Modify,
            path: "/attributes/on".into(),
            value: Some(json!(true)),
            headers: headers.clone(),
        }));
        roundtrip(Signal::Event(Event {
            entity_id: id.clone(),
            channel: Channel::Twin,
            action: Action::Modified,
            path: "/attributes/on".into(),
            value: Some(json!(false)),
            revision: Some(42),
            timestamp: None,
            headers: headers.clone(),
        }));
        roundtrip(Signal::Acknowledgement(
            Acknowledgement::new(AcknowledgementLabel::twin_persisted(), id.clone(), 204, headers.clone())
                .with_payload(json!({"ok": true})),
        ));
        roundtrip(Signal::Search(SearchCommand {
            action: Action::Subscribe,
            subscription_id: None,
            filter: Some("eq(attributes/on,true)".into()),
            namespaces: vec!["org.acme".into()],
            fields: None,
            demand: None,
            headers,
        }));
    }

    #[test]
    fn status_turns_command_into_response() {
        let json = json!({
            "topic": "org/t/things/live/commands/modify",
            "path": "/attributes/x",
            "status": 204,
            "headers": {"correlation-id": "abc"}
        });
        let adaptable = Adaptable::from_json(&json).unwrap();
        let signal = DittoProtocolAdapter.from_adaptable(&adaptable).unwrap();
        assert!(signal.is_live_command_response());
    }

    #[test]
    fn modify_without_value_is_rejected() {
        let adaptable = Adaptable::from_json(&json!({
            "topic": "org/t/things/twin/commands/modify",
            "path": "/attributes/x"
        }))
        .unwrap();
        assert!(DittoProtocolAdapter.from_adaptable(&adaptable).is_err());
    }
}
