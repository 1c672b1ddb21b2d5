//! Topic paths: `<namespace>/<entity>/<group>/<channel>/<criterion>[/<action>|/<subject>]`.
//!
//! The `policies` group carries no channel segment. Search signals use `_/_` as
//! namespace and entity name.

use crate::{
    entity::{EntityId, EntityType, PLACEHOLDER_SEGMENT},
    error::ConnectivityError,
};
use std::{fmt, str::FromStr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Group {
    Things,
    Policies,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Twin,
    Live,
    /// Groups without channels (policies).
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Criterion {
    Commands,
    Events,
    Search,
    Messages,
    Errors,
    Acks,
    Announcements,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Create,
    Retrieve,
    Modify,
    Merge,
    Delete,
    Created,
    Modified,
    Merged,
    Deleted,
    Subscribe,
    Request,
    Cancel,
    HasNext,
    Complete,
    Failed,
}

macro_rules! str_enum {
    ($ty:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $text,)+
                }
            }
        }

        impl FromStr for $ty {
            type Err = ConnectivityError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($ty::$variant),)+
                    other => Err(ConnectivityError::protocol(format!(
                        "unknown {} '{}'", stringify!($ty).to_lowercase(), other
                    ))),
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

str_enum!(Group { Things => "things", Policies => "policies" });
str_enum!(Channel { Twin => "twin", Live => "live", None => "" });
str_enum!(Criterion {
    Commands => "commands",
    Events => "events",
    Search => "search",
    Messages => "messages",
    Errors => "errors",
    Acks => "acks",
    Announcements => "announcements",
});
str_enum!(Action {
    Create => "create",
    Retrieve => "retrieve",
    Modify => "modify",
    Merge => "merge",
    Delete => "delete",
    Created => "created",
    Modified => "modified",
    Merged => "merged",
    Deleted => "deleted",
    Subscribe => "subscribe",
    Request => "request",
    Cancel => "cancel",
    HasNext => "next",
    Complete => "complete",
    Failed => "failed",
});

impl Action {
    /// Event action emitted after a successful command with this action.
    pub fn event_action(&self) -> Option<Action> {
        match self {
            Action::Create => Some(Action::Created),
            Action::Modify => Some(Action::Modified),
            Action::Merge => Some(Action::Merged),
            Action::Delete => Some(Action::Deleted),
            _ => None,
        }
    }
}

impl Group {
    pub fn entity_type(&self) -> EntityType {
        match self {
            Group::Things => EntityType::Thing,
            Group::Policies => EntityType::Policy,
        }
    }

    pub fn for_entity_type(entity_type: EntityType) -> Group {
        match entity_type {
            EntityType::Policy => Group::Policies,
            _ => Group::Things,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicPath {
    pub namespace: String,
    pub entity_name: String,
    pub group: Group,
    pub channel: Channel,
    pub criterion: Criterion,
    pub action: Option<Action>,
    pub subject: Option<String>,
}

impl TopicPath {
    pub fn new(entity_id: &EntityId, channel: Channel, criterion: Criterion) -> Self {
        let group = Group::for_entity_type(entity_id.entity_type());
        Self {
            namespace: entity_id.namespace().to_string(),
            entity_name: entity_id.name().to_string(),
            group,
            channel: if group == Group::Policies { Channel::None } else { channel },
            criterion,
            action: None,
            subject: None,
        }
    }

    pub fn search(action: Action) -> Self {
        Self {
            namespace: PLACEHOLDER_SEGMENT.to_string(),
            entity_name: PLACEHOLDER_SEGMENT.to_string(),
            group: Group::Things,
            channel: Channel::Twin,
            criterion: Criterion::Search,
            action: Some(action),
            subject: None,
        }
    }

    pub fn with_action(mut self, action: Action) -> Self {
        self.action = Some(action);
        self
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn entity_id(&self) -> EntityId {
        EntityId::new(self.group.entity_type(), &self.namespace, &self.entity_name)
    }

    pub fn is_live(&self) -> bool {
        self.channel == Channel::Live
    }

    pub fn parse(path: &str) -> Result<Self, ConnectivityError> {
        let invalid = |reason: &str| ConnectivityError::protocol(format!("invalid topic path '{path}': {reason}"));
        let mut parts = path.split('/');
        let namespace = parts.next().ok_or_else(|| invalid("namespace missing"))?;
        let entity_name = parts
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| invalid("entity name missing"))?;
        let group: Group = parts
            .next()
            .ok_or_else(|| invalid("group missing"))?
            .parse()?;
        let channel = match group {
            Group::Policies => Channel::None,
            Group::Things => {
                let raw = parts.next().ok_or_else(|| invalid("channel missing"))?;
                match raw {
                    "twin" => Channel::Twin,
                    "live" => Channel::Live,
                    _ => return Err(invalid("unknown channel")),
                }
            }
        };
        let criterion: Criterion = parts
            .next()
            .ok_or_else(|| invalid("criterion missing"))?
            .parse()?;
        let rest: Vec<&str> = parts.collect();
        let (action, subject) = match criterion {
            Criterion::Commands | Criterion::Events | Criterion::Search => {
                let [action] = rest.as_slice() else {
                    return Err(invalid("exactly one action expected"));
                };
                (Some(action.parse::<Action>()?), None)
            }
            Criterion::Messages | Criterion::Announcements => {
                if rest.is_empty() {
                    return Err(invalid("subject missing"));
                }
                (None, Some(rest.join("/")))
            }
            Criterion::Acks => (None, (!rest.is_empty()).then(|| rest.join("/"))),
            Criterion::Errors => {
                if !rest.is_empty() {
                    return Err(invalid("errors carry no action"));
                }
                (None, None)
            }
        };
        if criterion == Criterion::Messages && channel != Channel::Live {
            return Err(invalid("messages are only allowed on the live channel"));
        }
        Ok(Self {
            namespace: namespace.to_string(),
            entity_name: entity_name.to_string(),
            group,
            channel,
            criterion,
            action,
            subject,
        })
    }
}

impl FromStr for TopicPath {
    type Err = ConnectivityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for TopicPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.entity_name, self.group)?;
        if self.channel != Channel::None {
            write!(f, "/{}", self.channel)?;
        }
        write!(f, "/{}", self.criterion)?;
        if let Some(action) = &self.action {
            write!(f, "/{action}")?;
        }
        if let Some(subject) = &self.subject {
            write!(f, "/{subject}")?;
        }
        Ok(())
    }
}
