/// Label set attached to a span or metric emitted by an actor.
///
/// `instance` and `component` are always present; `key` narrows to a
/// specific bucket/scope/channel when the emitting actor is keyed.
#[derive(Debug, Clone)]
pub struct TelemetryLabels {
    pub instance: String,
    pub component: String,
    pub key: Option<String>,
    pub extra: Vec<(String, String)>,
}

impl TelemetryLabels {
    pub fn new(instance: impl Into<String>, component: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
            component: component.into(),
            key: None,
            extra: Vec::new(),
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_extra(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.push((name.into(), value.into()));
        self
    }

    pub fn tags(&self) -> Vec<(String, String)> {
        let mut tags = Vec::with_capacity(3 + self.extra.len());
        tags.push(("instance".into(), self.instance.clone()));
        tags.push(("component".into(), self.component.clone()));
        if let Some(key) = &self.key {
            tags.push(("key".into(), key.clone()));
        }
        tags.extend(self.extra.iter().cloned());
        tags
    }
}
