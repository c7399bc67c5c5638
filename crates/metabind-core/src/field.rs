//! Input fields bound to metadata properties.

use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use tracing::{debug, trace};

use crate::cache::SubscriberId;
use crate::error::MetabindError;
use crate::manager::{MetadataManager, Subscription};
use crate::signal::{ListenerId, MetadataSignal};
use crate::target::BindTarget;

const DATE_FORMAT: &str = "%Y-%m-%d";

/// The kinds of field that can be bound to a property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldKind {
    Toggle,
    Text,
    TextArea,
    Number,
    Slider { min: f64, max: f64 },
    Select { options: Vec<String> },
    Date,
    List,
}

impl FieldKind {
    pub fn name(&self) -> &'static str {
        match self {
            FieldKind::Toggle => "toggle",
            FieldKind::Text => "text",
            FieldKind::TextArea => "text_area",
            FieldKind::Number => "number",
            FieldKind::Slider { .. } => "slider",
            FieldKind::Select { .. } => "select",
            FieldKind::Date => "date",
            FieldKind::List => "list",
        }
    }

    /// Value shown when the bound property is absent.
    pub fn default_value(&self) -> Value {
        match self {
            FieldKind::Toggle => Value::Bool(false),
            FieldKind::Text | FieldKind::TextArea | FieldKind::Date => Value::String(String::new()),
            FieldKind::Number => Value::from(0),
            FieldKind::Slider { min, .. } => number(*min),
            FieldKind::Select { options } => options
                .first()
                .map(|o| Value::String(o.clone()))
                .unwrap_or(Value::Null),
            FieldKind::List => Value::Array(Vec::new()),
        }
    }

    /// Convert user input into the value stored for this kind of field.
    pub fn coerce(&self, value: Value) -> Result<Value, MetabindError> {
        match (self, value) {
            (FieldKind::Toggle, Value::Bool(b)) => Ok(Value::Bool(b)),
            (FieldKind::Toggle, Value::String(s)) => match s.trim() {
                "true" => Ok(Value::Bool(true)),
                "false" | "" => Ok(Value::Bool(false)),
                other => Err(self.reject(other)),
            },
            (FieldKind::Toggle, Value::Null) => Ok(Value::Bool(false)),

            (FieldKind::Text | FieldKind::TextArea, Value::String(s)) => Ok(Value::String(s)),
            (FieldKind::Text | FieldKind::TextArea, Value::Null) => {
                Ok(Value::String(String::new()))
            }
            (FieldKind::Text | FieldKind::TextArea, v @ (Value::Bool(_) | Value::Number(_))) => {
                Ok(Value::String(v.to_string()))
            }

            (FieldKind::Number, Value::Number(n)) => Ok(Value::Number(n)),
            (FieldKind::Number, Value::String(s)) => parse_number(&s)
                .map(number)
                .ok_or_else(|| self.reject(&s)),

            (FieldKind::Slider { min, max }, v) => {
                let n = match &v {
                    Value::Number(n) => n.as_f64(),
                    Value::String(s) => parse_number(s),
                    _ => None,
                }
                .ok_or_else(|| self.reject(&v.to_string()))?;
                Ok(number(n.clamp(*min, (*max).max(*min))))
            }

            (FieldKind::Select { options }, Value::String(s)) => {
                if options.is_empty() || options.contains(&s) {
                    Ok(Value::String(s))
                } else {
                    Err(self.reject(&s))
                }
            }

            (FieldKind::Date, Value::String(s)) => {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    return Ok(Value::String(String::new()));
                }
                NaiveDate::parse_from_str(trimmed, DATE_FORMAT)
                    .map(|date| Value::String(date.format(DATE_FORMAT).to_string()))
                    .map_err(|_| self.reject(trimmed))
            }

            (FieldKind::List, Value::Array(items)) => Ok(Value::Array(items)),
            (FieldKind::List, Value::Null) => Ok(Value::Array(Vec::new())),
            (FieldKind::List, item) => Ok(Value::Array(vec![item])),

            (_, other) => Err(self.reject(&other.to_string())),
        }
    }

    fn reject(&self, input: &str) -> MetabindError {
        MetabindError::Validation(format!("{input:?} is not a valid {} value", self.name()))
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for FieldKind {
    type Err = MetabindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "toggle" => Ok(FieldKind::Toggle),
            "text" => Ok(FieldKind::Text),
            "text_area" | "textarea" => Ok(FieldKind::TextArea),
            "number" => Ok(FieldKind::Number),
            "slider" => Ok(FieldKind::Slider {
                min: 0.0,
                max: 100.0,
            }),
            "select" => Ok(FieldKind::Select {
                options: Vec::new(),
            }),
            "date" => Ok(FieldKind::Date),
            "list" => Ok(FieldKind::List),
            other => Err(MetabindError::Validation(format!(
                "unknown field type {other:?}"
            ))),
        }
    }
}

fn parse_number(s: &str) -> Option<f64> {
    s.trim().parse::<f64>().ok().filter(|n| n.is_finite())
}

/// Integral values are stored as integers so `3` does not become `3.0`.
fn number(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::from(n as i64)
    } else {
        Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
    }
}

/// A field mounted onto a manager.
///
/// Owns the signal the manager writes into. Dropping the field unsubscribes
/// it.
pub struct BoundField {
    kind: FieldKind,
    target: BindTarget,
    subscriber: SubscriberId,
    signal: MetadataSignal,
    manager: MetadataManager,
    subscription: Option<Subscription>,
}

impl BoundField {
    /// Subscribe a new field of `kind` to `target`.
    pub async fn mount(
        manager: &MetadataManager,
        kind: FieldKind,
        target: BindTarget,
    ) -> Result<Self, MetabindError> {
        let subscriber = SubscriberId::new();
        let signal = MetadataSignal::new(None);

        let label = target.to_string();
        let subscription = manager
            .subscribe(subscriber, &signal, &target, move || {
                trace!(bind = %label, subscriber = %subscriber, "field unsubscribed");
            })
            .await?;

        debug!(bind = %target, kind = %kind, subscriber = %subscriber, "field mounted");
        Ok(Self {
            kind,
            target,
            subscriber,
            signal,
            manager: manager.clone(),
            subscription: Some(subscription),
        })
    }

    pub fn kind(&self) -> &FieldKind {
        &self.kind
    }

    pub fn target(&self) -> &BindTarget {
        &self.target
    }

    pub fn subscriber(&self) -> SubscriberId {
        self.subscriber
    }

    pub fn signal(&self) -> &MetadataSignal {
        &self.signal
    }

    pub fn is_mounted(&self) -> bool {
        self.subscription.is_some()
    }

    /// Current value, or the kind's default when the property is absent.
    pub fn value(&self) -> Value {
        self.signal
            .get()
            .unwrap_or_else(|| self.kind.default_value())
    }

    /// Run `f` whenever the field's value changes.
    pub fn on_change(&self, f: impl Fn(&Value) + Send + Sync + 'static) -> ListenerId {
        let kind = self.kind.clone();
        self.signal.register_listener(move |value| match value {
            Some(value) => f(value),
            None => f(&kind.default_value()),
        })
    }

    /// Apply a user edit: store it and update this field's own signal.
    ///
    /// Other fields bound to the same property are notified by the manager;
    /// this one is excluded so it does not receive its own edit back.
    pub async fn set_value(&self, value: Value) -> Result<(), MetabindError> {
        let value = self.kind.coerce(value)?;
        self.manager
            .write_excluding(value, &self.target, Some(self.subscriber))
            .await?;
        self.manager.resync(&self.target, &self.signal);
        Ok(())
    }

    pub fn unmount(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.unsubscribe();
            self.signal.unregister_all_listeners();
            debug!(bind = %self.target, subscriber = %self.subscriber, "field unmounted");
        }
    }
}

impl Drop for BoundField {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl fmt::Debug for BoundField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundField")
            .field("kind", &self.kind)
            .field("target", &self.target)
            .field("subscriber", &self.subscriber)
            .field("mounted", &self.is_mounted())
            .finish()
    }
}
