//! Object templates.
//!
//! An [`ObjectTemplate`] walks a value recursively and replaces every string it
//! contains with the result of rendering that string as a Handlebars template. The
//! data comes from the alert that activated the rule, with a few named variables
//! bound on top of it (`alert`, `labels` and `annotations` by default), so an action
//! can say `{{labels.instance}}` or `{{alert.annotations.message}}`.
//!
//! Which parts of a value are walked is declared by implementing [`Expand`]:
//! - strings are rendered
//! - maps are walked by value, keys are never rendered
//! - sequences, optionals and boxes are walked when present
//! - JSON documents are walked through objects and arrays; numbers, booleans and
//!   nulls are left alone
//! - Kubernetes objects are walked through their JSON form
//!
//! Expansion stops at the first error. Strings already rendered at that point keep
//! their new value, so callers should expand a copy.

use handlebars::{no_escape, Handlebars};
use k8s_openapi::api::batch::v1::Job;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use tracing::trace;

use crate::error::TemplateError;
use crate::rules::Delimiters;

const DEFAULT_LEFT: &str = "{{";
const DEFAULT_RIGHT: &str = "}}";

/// Values whose strings can be rendered in place.
pub trait Expand {
    fn expand(&mut self, renderer: &Renderer<'_>) -> Result<(), TemplateError>;
}

/// Builder for [`ObjectTemplate`].
#[derive(Debug, Clone)]
pub struct ObjectTemplateBuilder {
    left: String,
    right: String,
    variables: Vec<(String, String)>,
}

impl Default for ObjectTemplateBuilder {
    fn default() -> Self {
        Self {
            left: DEFAULT_LEFT.to_string(),
            right: DEFAULT_RIGHT.to_string(),
            variables: Vec::new(),
        }
    }
}

impl ObjectTemplateBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Use other delimiters than `{{` and `}}`. Useful when the action carries text
    /// with its own templates, Ansible variables for example.
    #[must_use]
    pub fn delimiters(mut self, left: &str, right: &str) -> Self {
        self.left = left.to_string();
        self.right = right.to_string();
        self
    }

    /// Bind `name` to the part of the data found at `path`, a JSON pointer (`""` is
    /// the whole data, `/labels` its labels).
    #[must_use]
    pub fn variable(mut self, name: &str, path: &str) -> Self {
        self.variables.push((name.to_string(), path.to_string()));
        self
    }

    #[must_use]
    pub fn build(self) -> ObjectTemplate {
        let mut handlebars = Handlebars::new();
        handlebars.set_strict_mode(true);
        handlebars.register_escape_fn(no_escape);

        ObjectTemplate {
            handlebars,
            left: self.left,
            right: self.right,
            variables: self.variables,
        }
    }
}

/// Renders the strings inside objects.
pub struct ObjectTemplate {
    handlebars: Handlebars<'static>,
    left: String,
    right: String,
    variables: Vec<(String, String)>,
}

impl ObjectTemplate {
    /// Template used for rule actions: binds `alert`, `labels` and `annotations`,
    /// and honors the rule's delimiters.
    #[must_use]
    pub fn for_alerts(delimiters: Option<&Delimiters>) -> Self {
        let mut builder = ObjectTemplateBuilder::new()
            .variable("alert", "")
            .variable("labels", "/labels")
            .variable("annotations", "/annotations");
        if let Some(delimiters) = delimiters {
            builder = builder.delimiters(&delimiters.left, &delimiters.right);
        }
        builder.build()
    }

    /// Render every string inside `object` using `data`.
    pub fn process<T, D>(&self, object: &mut T, data: &D) -> Result<(), TemplateError>
    where
        T: Expand + ?Sized,
        D: Serialize + ?Sized,
    {
        let renderer = self.renderer(data)?;
        object.expand(&renderer)
    }

    /// Prepare the evaluation context for `data` once, to render many strings.
    pub fn renderer<D: Serialize + ?Sized>(&self, data: &D) -> Result<Renderer<'_>, TemplateError> {
        let data = serde_json::to_value(data)?;
        let mut context = match &data {
            Value::Object(fields) => fields.clone(),
            _ => Map::new(),
        };
        for (name, path) in &self.variables {
            let value = data
                .pointer(path)
                .cloned()
                .ok_or_else(|| TemplateError::UnknownVariable {
                    name: name.clone(),
                    path: path.clone(),
                })?;
            context.insert(name.clone(), value);
        }
        Ok(Renderer {
            template: self,
            context: Value::Object(context),
        })
    }

    /// Rewrite custom delimiters into the Handlebars ones.
    ///
    /// Only `left ... right` pairs become expressions. Any literal `{{` between them is
    /// escaped so that it comes out untouched, and an opening delimiter without a
    /// closing one is left as text.
    fn translate(&self, text: &str) -> String {
        if self.left == DEFAULT_LEFT && self.right == DEFAULT_RIGHT {
            return text.to_string();
        }

        let mut out = String::with_capacity(text.len() + 8);
        let mut rest = text;
        while let Some(start) = rest.find(self.left.as_str()) {
            let inner = &rest[start + self.left.len()..];
            let Some(end) = inner.find(self.right.as_str()) else {
                break;
            };
            out.push_str(&escape_literal(&rest[..start]));
            out.push_str(DEFAULT_LEFT);
            out.push_str(&inner[..end]);
            out.push_str(DEFAULT_RIGHT);
            rest = &inner[end + self.right.len()..];
        }
        out.push_str(&escape_literal(rest));
        out
    }
}

fn escape_literal(text: &str) -> String {
    text.replace(DEFAULT_LEFT, "\\{{")
}

/// An [`ObjectTemplate`] bound to the data of one alert.
pub struct Renderer<'a> {
    template: &'a ObjectTemplate,
    context: Value,
}

impl Renderer<'_> {
    /// Render one string. Text without an opening delimiter is returned as is.
    pub fn render(&self, text: &str) -> Result<String, TemplateError> {
        if !text.contains(self.template.left.as_str()) {
            return Ok(text.to_string());
        }
        let source = self.template.translate(text);
        trace!(original = %text, generated = %source, "Rendering template");

        self.template
            .handlebars
            .render_template(&source, &self.context)
            .map_err(|e| TemplateError::Render {
                text: text.to_string(),
                source: Box::new(e),
            })
    }
}

impl Expand for String {
    fn expand(&mut self, renderer: &Renderer<'_>) -> Result<(), TemplateError> {
        *self = renderer.render(self)?;
        Ok(())
    }
}

impl<T: Expand> Expand for Option<T> {
    fn expand(&mut self, renderer: &Renderer<'_>) -> Result<(), TemplateError> {
        match self {
            Some(value) => value.expand(renderer),
            None => Ok(()),
        }
    }
}

impl<T: Expand + ?Sized> Expand for Box<T> {
    fn expand(&mut self, renderer: &Renderer<'_>) -> Result<(), TemplateError> {
        (**self).expand(renderer)
    }
}

impl<T: Expand> Expand for Vec<T> {
    fn expand(&mut self, renderer: &Renderer<'_>) -> Result<(), TemplateError> {
        self.iter_mut().try_for_each(|item| item.expand(renderer))
    }
}

impl<K, V: Expand, S> Expand for HashMap<K, V, S> {
    fn expand(&mut self, renderer: &Renderer<'_>) -> Result<(), TemplateError> {
        self.values_mut().try_for_each(|value| value.expand(renderer))
    }
}

impl<K, V: Expand> Expand for BTreeMap<K, V> {
    fn expand(&mut self, renderer: &Renderer<'_>) -> Result<(), TemplateError> {
        self.values_mut().try_for_each(|value| value.expand(renderer))
    }
}

impl Expand for Value {
    fn expand(&mut self, renderer: &Renderer<'_>) -> Result<(), TemplateError> {
        match self {
            Value::String(text) => text.expand(renderer),
            Value::Array(items) => items.expand(renderer),
            Value::Object(fields) => fields
                .values_mut()
                .try_for_each(|value| value.expand(renderer)),
            Value::Null | Value::Bool(_) | Value::Number(_) => Ok(()),
        }
    }
}

impl Expand for Job {
    fn expand(&mut self, renderer: &Renderer<'_>) -> Result<(), TemplateError> {
        let mut value = serde_json::to_value(&*self)?;
        value.expand(renderer)?;
        *self = serde_json::from_value(value)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::Alert;
    use serde_json::json;

    fn alert() -> Alert {
        Alert::firing("NodeDown")
            .with_label("instance", "node0")
            .with_annotation("message", "Node node0 is down")
    }

    #[test]
    fn test_plain_text_is_unchanged() {
        let template = ObjectTemplate::for_alerts(None);
        let mut text = "no templates here, just $dollars and [brackets]".to_string();
        template.process(&mut text, &alert()).unwrap();
        assert_eq!(text, "no templates here, just $dollars and [brackets]");
    }

    #[test]
    fn test_variables_are_bound() {
        let template = ObjectTemplate::for_alerts(None);
        let mut text =
            "{{labels.instance}} / {{annotations.message}} / {{alert.labels.alertname}} / {{status}}"
                .to_string();
        template.process(&mut text, &alert()).unwrap();
        assert_eq!(text, "node0 / Node node0 is down / NodeDown / firing");
    }

    #[test]
    fn test_output_is_not_html_escaped() {
        let template = ObjectTemplate::for_alerts(None);
        let alert = Alert::firing("A").with_annotation("message", "a < b & \"c\"");
        let mut text = "{{annotations.message}}".to_string();
        template.process(&mut text, &alert).unwrap();
        assert_eq!(text, "a < b & \"c\"");
    }

    #[test]
    fn test_custom_delimiters_keep_foreign_templates() {
        let template = ObjectTemplate::for_alerts(Some(&Delimiters {
            left: "[[".to_string(),
            right: "]]".to_string(),
        }));
        let mut text = "host=[[ labels.instance ]] var={{ ansible_host }}".to_string();
        template.process(&mut text, &alert()).unwrap();
        assert_eq!(text, "host=node0 var={{ ansible_host }}");
    }

    #[test]
    fn test_single_character_right_delimiter() {
        let template = ObjectTemplate::for_alerts(Some(&Delimiters {
            left: "${".to_string(),
            right: "}".to_string(),
        }));
        let mut text = "host=${labels.instance} var={{ ansible_host }}".to_string();
        template.process(&mut text, &alert()).unwrap();
        assert_eq!(text, "host=node0 var={{ ansible_host }}");

        let mut json = r#"{"host": "${labels.instance}", "vars": {"a": "{{ b }}"}}"#.to_string();
        template.process(&mut json, &alert()).unwrap();
        assert_eq!(json, r#"{"host": "node0", "vars": {"a": "{{ b }}"}}"#);
    }

    #[test]
    fn test_unclosed_custom_delimiter_is_text() {
        let template = ObjectTemplate::for_alerts(Some(&Delimiters {
            left: "[[".to_string(),
            right: "]]".to_string(),
        }));
        let mut text = "[[ labels.instance ]] and [[ dangling".to_string();
        template.process(&mut text, &alert()).unwrap();
        assert_eq!(text, "node0 and [[ dangling");
    }

    #[test]
    fn test_maps_render_values_not_keys() {
        let template = ObjectTemplate::for_alerts(None);
        let mut map = BTreeMap::new();
        map.insert("{{labels.instance}}".to_string(), "{{labels.instance}}".to_string());
        template.process(&mut map, &alert()).unwrap();
        assert_eq!(map["{{labels.instance}}"], "node0");
    }

    #[test]
    fn test_json_documents_are_walked() {
        let template = ObjectTemplate::for_alerts(None);
        let mut doc = json!({
            "node": "{{labels.instance}}",
            "retries": 3,
            "force": true,
            "nothing": null,
            "hosts": ["{{labels.instance}}", "static"],
            "nested": {"msg": "{{annotations.message}}"}
        });
        template.process(&mut doc, &alert()).unwrap();
        assert_eq!(
            doc,
            json!({
                "node": "node0",
                "retries": 3,
                "force": true,
                "nothing": null,
                "hosts": ["node0", "static"],
                "nested": {"msg": "Node node0 is down"}
            })
        );
    }

    #[test]
    fn test_absent_option_is_a_noop() {
        let template = ObjectTemplate::for_alerts(None);
        let mut none: Option<String> = None;
        template.process(&mut none, &alert()).unwrap();
        assert!(none.is_none());

        let mut some = Some("{{labels.instance}}".to_string());
        template.process(&mut some, &alert()).unwrap();
        assert_eq!(some.as_deref(), Some("node0"));
    }

    #[test]
    fn test_undefined_reference_is_an_error() {
        let template = ObjectTemplate::for_alerts(None);
        let mut text = "{{labels.missing}}".to_string();
        let err = template.process(&mut text, &alert()).unwrap_err();
        assert!(matches!(err, TemplateError::Render { .. }));
    }

    #[test]
    fn test_syntax_error_is_an_error() {
        let template = ObjectTemplate::for_alerts(None);
        let mut text = "{{#if labels.instance}}unterminated".to_string();
        assert!(template.process(&mut text, &alert()).is_err());
    }

    #[test]
    fn test_custom_variable_paths() {
        let template = ObjectTemplateBuilder::new()
            .variable("host", "/labels/instance")
            .build();
        let mut text = "ssh {{host}}".to_string();
        template.process(&mut text, &alert()).unwrap();
        assert_eq!(text, "ssh node0");

        let broken = ObjectTemplateBuilder::new()
            .variable("x", "/does/not/exist")
            .build();
        let mut text = "{{x}}".to_string();
        assert!(matches!(
            broken.process(&mut text, &alert()),
            Err(TemplateError::UnknownVariable { .. })
        ));
    }

    #[test]
    fn test_batch_job_is_walked() {
        let template = ObjectTemplate::for_alerts(None);
        let mut job: Job = serde_json::from_value(json!({
            "metadata": {"name": "heal-{{labels.instance}}"},
            "spec": {
                "backoffLimit": 2,
                "template": {
                    "spec": {
                        "restartPolicy": "Never",
                        "containers": [{
                            "name": "heal",
                            "image": "busybox",
                            "command": ["echo", "{{annotations.message}}"]
                        }]
                    }
                }
            }
        }))
        .unwrap();

        template.process(&mut job, &alert()).unwrap();

        assert_eq!(job.metadata.name.as_deref(), Some("heal-node0"));
        let spec = job.spec.unwrap();
        assert_eq!(spec.backoff_limit, Some(2));
        let container = &spec.template.spec.unwrap().containers[0];
        assert_eq!(
            container.command.as_deref(),
            Some(&["echo".to_string(), "Node node0 is down".to_string()][..])
        );
    }
}
