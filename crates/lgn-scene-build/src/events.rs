//! Event trees authored in the editor.
//!
//! The build only cares about the parts of an event tree that pull in other
//! compilation units: link events (to external events or another scene's
//! events), C++ code events (to source files) and instruction parameters
//! referring to either. Everything else is carried along untouched for the
//! code generator.

use serde::{Deserialize, Serialize};

/// Parameter of an instruction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Parameter {
    /// Plain expression, opaque to the build.
    Expression(String),
    /// Name of an external events list.
    ExternalEvents(String),
    /// Name of a project source file.
    SourceFile(String),
}

/// A condition or an action.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
    pub kind: String,
    pub parameters: Vec<Parameter>,
}

impl Instruction {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            parameters: vec![],
        }
    }

    #[must_use]
    pub fn with_parameter(mut self, parameter: Parameter) -> Self {
        self.parameters.push(parameter);
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    Standard {
        conditions: Vec<Instruction>,
        actions: Vec<Instruction>,
        sub_events: EventList,
    },
    /// Includes the events of the external events list, or of the scene,
    /// named `target`.
    Link { target: String },
    /// Calls into a function defined in `associated_file`.
    CppCode {
        associated_file: Option<String>,
        dependent_files: Vec<String>,
    },
    Comment(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    pub disabled: bool,
}

impl Event {
    pub fn standard(conditions: Vec<Instruction>, actions: Vec<Instruction>) -> Self {
        Self::from(EventKind::Standard {
            conditions,
            actions,
            sub_events: EventList::default(),
        })
    }

    pub fn link(target: impl Into<String>) -> Self {
        Self::from(EventKind::Link {
            target: target.into(),
        })
    }

    pub fn cpp_code(associated_file: impl Into<String>) -> Self {
        Self::from(EventKind::CppCode {
            associated_file: Some(associated_file.into()),
            dependent_files: vec![],
        })
    }

    pub fn comment(text: impl Into<String>) -> Self {
        Self::from(EventKind::Comment(text.into()))
    }

    /// Appends a sub event. Has no effect on events that cannot hold any.
    #[must_use]
    pub fn with_sub_event(mut self, event: Event) -> Self {
        if let EventKind::Standard { sub_events, .. } = &mut self.kind {
            sub_events.push(event);
        }
        self
    }

    #[must_use]
    pub fn disabled(mut self) -> Self {
        self.disabled = true;
        self
    }

    pub fn sub_events(&self) -> Option<&EventList> {
        match &self.kind {
            EventKind::Standard { sub_events, .. } => Some(sub_events),
            _ => None,
        }
    }

    pub fn instructions(&self) -> impl Iterator<Item = &Instruction> {
        let (conditions, actions): (&[Instruction], &[Instruction]) = match &self.kind {
            EventKind::Standard {
                conditions,
                actions,
                ..
            } => (conditions, actions),
            _ => (&[], &[]),
        };
        conditions.iter().chain(actions.iter())
    }
}

impl From<EventKind> for Event {
    fn from(kind: EventKind) -> Self {
        Self {
            kind,
            disabled: false,
        }
    }
}

/// Ordered list of events.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventList(Vec<Event>);

impl EventList {
    pub fn new(events: Vec<Event>) -> Self {
        Self(events)
    }

    pub fn push(&mut self, event: Event) {
        self.0.push(event);
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Event> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns a copy of the list without events that produce no code:
    /// disabled events and comments, recursively.
    #[must_use]
    pub fn without_useless_events(&self) -> Self {
        let events = self
            .0
            .iter()
            .filter(|event| !event.disabled && !matches!(event.kind, EventKind::Comment(_)))
            .map(|event| match &event.kind {
                EventKind::Standard {
                    conditions,
                    actions,
                    sub_events,
                } => Event {
                    kind: EventKind::Standard {
                        conditions: conditions.clone(),
                        actions: actions.clone(),
                        sub_events: sub_events.without_useless_events(),
                    },
                    disabled: false,
                },
                _ => event.clone(),
            })
            .collect();
        Self(events)
    }
}

impl FromIterator<Event> for EventList {
    fn from_iter<I: IntoIterator<Item = Event>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a EventList {
    type Item = &'a Event;
    type IntoIter = std::slice::Iter<'a, Event>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
