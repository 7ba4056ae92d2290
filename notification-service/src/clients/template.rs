use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use chrono::{DateTime, Datelike, Utc};
use handlebars::Handlebars;
use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};

use crate::{
    config::TemplateConfig,
    error::RenderError,
    models::{request::Priority, template::Template},
};

pub const DEFAULT_TEMPLATE_ID: &str = "default";
pub const DEFAULT_SUBJECT: &str = "New Notification";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Layout {
    Inquiry,
    Content,
    Alert,
    Generic,
}

/// Event type to template mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventRoute {
    pub event_type: &'static str,
    pub template_id: &'static str,
    pub subject: &'static str,
    layout: Layout,
}

const fn route(
    event_type: &'static str,
    template_id: &'static str,
    subject: &'static str,
    layout: Layout,
) -> EventRoute {
    EventRoute {
        event_type,
        template_id,
        subject,
        layout,
    }
}

const ROUTES: &[EventRoute] = &[
    route("inquiry-business", "business-inquiry", "New Business Inquiry Received", Layout::Inquiry),
    route("inquiry-donations", "donation-inquiry", "New Donation Inquiry Received", Layout::Inquiry),
    route("inquiry-events", "event-inquiry", "New Event Inquiry Received", Layout::Inquiry),
    route("inquiry-media", "media-inquiry", "New Media Inquiry Received", Layout::Inquiry),
    route("inquiry-volunteers", "volunteer-inquiry", "New Volunteer Inquiry Received", Layout::Inquiry),
    route("event-published", "event-published", "New Event Published", Layout::Content),
    route("news-published", "news-published", "News Article Published", Layout::Content),
    route("system-alert", "system-alert", "System Alert", Layout::Alert),
    route("capacity-warning", "capacity-warning", "Event Capacity Warning", Layout::Alert),
    route("compliance-alert", "compliance-alert", "Compliance Alert", Layout::Alert),
];

const DEFAULT_ROUTE: EventRoute = route("", DEFAULT_TEMPLATE_ID, DEFAULT_SUBJECT, Layout::Generic);

/// Resolves the template and subject for an event type, falling back to the default route.
pub fn resolve_route(event_type: &str) -> EventRoute {
    ROUTES
        .iter()
        .find(|r| r.event_type == event_type)
        .copied()
        .unwrap_or(DEFAULT_ROUTE)
}

fn built_in_template(template_id: &str) -> Option<Template> {
    let route = ROUTES
        .iter()
        .chain(std::iter::once(&DEFAULT_ROUTE))
        .find(|r| r.template_id == template_id)?;

    let (html, text, variables): (&str, &str, &[&str]) = match route.layout {
        Layout::Inquiry => (INQUIRY_HTML, INQUIRY_TEXT, &["entity_id"]),
        Layout::Content => (CONTENT_HTML, CONTENT_TEXT, &["entity_id"]),
        Layout::Alert => (ALERT_HTML, ALERT_TEXT, &[]),
        Layout::Generic => (GENERIC_HTML, GENERIC_TEXT, &[]),
    };

    Some(Template {
        id: route.template_id.to_string(),
        event_type: if route.event_type.is_empty() {
            "*".to_string()
        } else {
            route.event_type.to_string()
        },
        subject: route.subject.to_string(),
        body_html: Some(html.to_string()),
        body_text: Some(text.to_string()),
        variables: variables.iter().map(|v| v.to_string()).collect(),
    })
}

/// Output of a render: subject plus rich and plain bodies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedContent {
    pub subject: String,
    pub html: String,
    pub text: String,
}

/// A template with its sources compiled. Entries are immutable once cached, so a render
/// never depends on the cache still holding them.
struct CompiledTemplate {
    template: Arc<Template>,
    html: Handlebars<'static>,
    text: Handlebars<'static>,
}

impl CompiledTemplate {
    fn compile(template: Template) -> Result<Self, RenderError> {
        let invalid = |e: handlebars::TemplateError| RenderError::InvalidTemplate {
            id: template.id.clone(),
            reason: e.to_string(),
        };

        let mut html = Handlebars::new();
        let mut text = Handlebars::new();
        text.register_escape_fn(handlebars::no_escape);

        text.register_template_string(&template.subject_key(), &template.subject)
            .map_err(invalid)?;
        if let Some(body) = &template.body_html {
            html.register_template_string(&template.html_key(), body)
                .map_err(invalid)?;
        }
        if let Some(body) = &template.body_text {
            text.register_template_string(&template.text_key(), body)
                .map_err(invalid)?;
        }

        Ok(Self {
            template: Arc::new(template),
            html,
            text,
        })
    }
}

/// Read-through template cache and renderer.
///
/// Reads take a shared lock; populating an entry takes the write lock once per template.
pub struct TemplateRenderer {
    settings: TemplateConfig,
    overrides: RwLock<HashMap<String, Template>>,
    cache: RwLock<HashMap<String, Arc<CompiledTemplate>>>,
}

impl TemplateRenderer {
    pub fn new(settings: TemplateConfig) -> Self {
        info!(company = %settings.company_name, "Template renderer initialized");

        Self {
            settings,
            overrides: RwLock::new(HashMap::new()),
            cache: RwLock::new(HashMap::new()),
        }
    }

    fn poisoned<T>(_: T) -> RenderError {
        RenderError::Cache("template lock poisoned".to_string())
    }

    /// Registers a template that takes precedence over the built-in one with the same id.
    pub fn register_template(&self, template: Template) -> Result<(), RenderError> {
        Self::validate_template(&template)?;

        let id = template.id.clone();
        self.overrides
            .write()
            .map_err(Self::poisoned)?
            .insert(id.clone(), template);
        self.cache.write().map_err(Self::poisoned)?.remove(&id);

        debug!(template_id = %id, "Template registered");
        Ok(())
    }

    pub fn load_template(&self, template_id: &str) -> Result<Arc<Template>, RenderError> {
        Ok(Arc::clone(&self.compiled(template_id)?.template))
    }

    fn compiled(&self, template_id: &str) -> Result<Arc<CompiledTemplate>, RenderError> {
        if let Some(compiled) = self.cache.read().map_err(Self::poisoned)?.get(template_id) {
            return Ok(Arc::clone(compiled));
        }

        let source = self
            .overrides
            .read()
            .map_err(Self::poisoned)?
            .get(template_id)
            .cloned()
            .or_else(|| built_in_template(template_id))
            .ok_or_else(|| RenderError::NotFound(template_id.to_string()))?;

        Self::validate_template(&source)?;
        let compiled = Arc::new(CompiledTemplate::compile(source)?);

        let mut cache = self.cache.write().map_err(Self::poisoned)?;
        // another worker may have populated it while we compiled
        let entry = cache
            .entry(template_id.to_string())
            .or_insert_with(|| {
                debug!(template_id, "Template loaded into cache");
                compiled
            });
        Ok(Arc::clone(entry))
    }

    pub fn validate_template(template: &Template) -> Result<(), RenderError> {
        let invalid = |reason: &str| RenderError::InvalidTemplate {
            id: template.id.clone(),
            reason: reason.to_string(),
        };

        if template.id.trim().is_empty() {
            return Err(invalid("id is empty"));
        }
        if template.event_type.trim().is_empty() {
            return Err(invalid("event type is empty"));
        }
        if template.subject.trim().is_empty() {
            return Err(invalid("subject is empty"));
        }

        let bodies: Vec<&String> = [&template.body_html, &template.body_text]
            .into_iter()
            .flatten()
            .filter(|b| !b.trim().is_empty())
            .collect();
        if bodies.is_empty() {
            return Err(invalid("neither an HTML nor a text body is present"));
        }

        for source in bodies.into_iter().chain(std::iter::once(&template.subject)) {
            handlebars::Template::compile(source).map_err(|e| invalid(&e.to_string()))?;
        }

        Ok(())
    }

    pub fn clear_cache(&self) -> Result<(), RenderError> {
        let mut cache = self.cache.write().map_err(Self::poisoned)?;
        let evicted = cache.len();
        cache.clear();

        info!(evicted, "Template cache cleared");
        Ok(())
    }

    /// Renders `(html, text)` for a template. A missing body renders as an empty string.
    pub fn render_template(
        &self,
        template_id: &str,
        data: &Map<String, Value>,
    ) -> Result<(String, String), RenderError> {
        let rendered = self.render(template_id, data)?;
        Ok((rendered.html, rendered.text))
    }

    pub fn render(
        &self,
        template_id: &str,
        data: &Map<String, Value>,
    ) -> Result<RenderedContent, RenderError> {
        let compiled = self.compiled(template_id)?;
        let template = &compiled.template;
        let mut context = self.enrich(data);

        for variable in &template.variables {
            match context.get(variable) {
                None | Some(Value::Null) => {
                    warn!(template_id, variable = %variable, "Template variable missing");
                    return Err(RenderError::MissingVariable {
                        template: template_id.to_string(),
                        variable: variable.clone(),
                    });
                }
                Some(_) => {}
            }
        }

        let render_err = |e: handlebars::RenderError| RenderError::Render(e.to_string());

        let subject = compiled
            .text
            .render(&template.subject_key(), &Value::Object(context.clone()))
            .map_err(render_err)?;
        context.insert("subject".to_string(), Value::String(subject.clone()));
        let context = Value::Object(context);

        let html = match template.body_html {
            Some(_) => compiled.html.render(&template.html_key(), &context).map_err(render_err)?,
            None => String::new(),
        };
        let text = match template.body_text {
            Some(_) => compiled.text.render(&template.text_key(), &context).map_err(render_err)?,
            None => String::new(),
        };

        debug!(template_id, "Template rendered successfully");
        Ok(RenderedContent { subject, html, text })
    }

    /// Adds common variables. Caller-supplied keys win.
    ///
    /// Dates derive from the `timestamp` field when present so that rendering is reproducible.
    fn enrich(&self, data: &Map<String, Value>) -> Map<String, Value> {
        let mut context = data.clone();

        let priority = data
            .get("priority")
            .and_then(|v| serde_json::from_value::<Priority>(v.clone()).ok())
            .unwrap_or_default();

        let timestamp = data
            .get("timestamp")
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        let action_url = match data.get("entity_id").and_then(Value::as_str) {
            Some(entity_id) => format!("{}/entities/{}", self.settings.base_url, entity_id),
            None => self.settings.base_url.clone(),
        };

        let unsubscribe_url = match data.get("user_id").and_then(Value::as_str) {
            Some(user_id) => format!("{}?subscriber={}", self.settings.unsubscribe_url, user_id),
            None => self.settings.unsubscribe_url.clone(),
        };

        let derived = json!({
            "priority": priority.as_str(),
            "priority_label": priority.as_str().to_uppercase(),
            "priority_color": priority.color(),
            "priority_icon": priority.icon(),
            "current_date": timestamp.format("%B %-d, %Y").to_string(),
            "current_year": timestamp.year(),
            "company_name": self.settings.company_name,
            "support_email": self.settings.support_email,
            "dashboard_url": self.settings.base_url,
            "action_url": action_url,
            "unsubscribe_url": unsubscribe_url,
        });

        if let Value::Object(derived) = derived {
            for (key, value) in derived {
                context.entry(key).or_insert(value);
            }
        }

        context
    }
}

const INQUIRY_HTML: &str = r#"<!DOCTYPE html>
<html lang="en">
<body style="margin: 0; padding: 0; font-family: -apple-system, 'Segoe UI', Roboto, sans-serif; background-color: #f4f4f5;">
  <table role="presentation" width="100%" cellspacing="0" cellpadding="0" style="max-width: 600px; margin: 0 auto; padding: 32px 16px;">
    <tr>
      <td style="background-color: #ffffff; border-radius: 8px; padding: 32px; border-top: 4px solid {{priority_color}};">
        <p style="color: {{priority_color}}; font-size: 12px; font-weight: 600; margin: 0 0 8px 0;">{{priority_icon}} {{priority_label}} PRIORITY</p>
        <h1 style="color: #18181b; font-size: 22px; margin: 0 0 16px 0;">{{subject}}</h1>
        <p style="color: #52525b; font-size: 15px; line-height: 22px; margin: 0 0 24px 0;">
          A new inquiry ({{entity_id}}) was submitted on {{current_date}} and is waiting for review.
        </p>
        {{#if details}}
        <table width="100%" cellspacing="0" cellpadding="6" style="border-collapse: collapse; margin-bottom: 24px;">
          {{#each details}}
          <tr>
            <td style="color: #71717a; font-size: 13px; border-bottom: 1px solid #e4e4e7;">{{label}}</td>
            <td style="color: #18181b; font-size: 13px; border-bottom: 1px solid #e4e4e7;">{{value}}</td>
          </tr>
          {{/each}}
        </table>
        {{/if}}
        <a href="{{action_url}}" style="display: inline-block; background-color: {{priority_color}}; color: #ffffff; font-size: 15px; padding: 10px 24px; text-decoration: none; border-radius: 6px;">Review inquiry</a>
      </td>
    </tr>
    <tr>
      <td style="color: #a1a1aa; font-size: 12px; text-align: center; padding-top: 16px;">
        &copy; {{current_year}} {{company_name}} &middot; <a href="mailto:{{support_email}}" style="color: #a1a1aa;">{{support_email}}</a> &middot; <a href="{{unsubscribe_url}}" style="color: #a1a1aa;">Unsubscribe</a>
      </td>
    </tr>
  </table>
</body>
</html>
"#;

const INQUIRY_TEXT: &str = r#"{{subject}} [{{priority_label}}]

A new inquiry ({{entity_id}}) was submitted on {{current_date}} and is waiting for review.
{{#each details}}
- {{label}}: {{value}}
{{/each}}

Review it here: {{action_url}}

--
{{company_name}} | {{support_email}}
Unsubscribe: {{unsubscribe_url}}
"#;

const CONTENT_HTML: &str = r#"<!DOCTYPE html>
<html lang="en">
<body style="margin: 0; padding: 0; font-family: -apple-system, 'Segoe UI', Roboto, sans-serif; background-color: #f4f4f5;">
  <table role="presentation" width="100%" cellspacing="0" cellpadding="0" style="max-width: 600px; margin: 0 auto; padding: 32px 16px;">
    <tr>
      <td style="background-color: #ffffff; border-radius: 8px; padding: 32px;">
        <h1 style="color: #18181b; font-size: 22px; margin: 0 0 16px 0;">{{subject}}</h1>
        {{#if title}}<h2 style="color: #3f3f46; font-size: 18px; margin: 0 0 12px 0;">{{title}}</h2>{{/if}}
        {{#if summary}}<p style="color: #52525b; font-size: 15px; line-height: 22px;">{{summary}}</p>{{/if}}
        <a href="{{action_url}}" style="display: inline-block; background-color: {{priority_color}}; color: #ffffff; font-size: 15px; padding: 10px 24px; text-decoration: none; border-radius: 6px;">Read more</a>
      </td>
    </tr>
    <tr>
      <td style="color: #a1a1aa; font-size: 12px; text-align: center; padding-top: 16px;">
        &copy; {{current_year}} {{company_name}} &middot; <a href="{{unsubscribe_url}}" style="color: #a1a1aa;">Unsubscribe</a>
      </td>
    </tr>
  </table>
</body>
</html>
"#;

const CONTENT_TEXT: &str = r#"{{subject}}
{{#if title}}
{{title}}
{{/if}}
{{#if summary}}
{{summary}}
{{/if}}

Read more: {{action_url}}

--
{{company_name}}
Unsubscribe: {{unsubscribe_url}}
"#;

const ALERT_HTML: &str = r#"<!DOCTYPE html>
<html lang="en">
<body style="margin: 0; padding: 0; font-family: -apple-system, 'Segoe UI', Roboto, sans-serif; background-color: #f4f4f5;">
  <table role="presentation" width="100%" cellspacing="0" cellpadding="0" style="max-width: 600px; margin: 0 auto; padding: 32px 16px;">
    <tr>
      <td style="background-color: #ffffff; border-radius: 8px; padding: 32px; border-left: 6px solid {{priority_color}};">
        <h1 style="color: {{priority_color}}; font-size: 22px; margin: 0 0 16px 0;">{{priority_icon}} {{subject}}</h1>
        {{#if message}}<p style="color: #18181b; font-size: 15px; line-height: 22px;">{{message}}</p>{{/if}}
        {{#each details}}
        <p style="color: #52525b; font-size: 13px; margin: 4px 0;"><strong>{{label}}:</strong> {{value}}</p>
        {{/each}}
        <p style="color: #71717a; font-size: 12px; margin-top: 24px;">Raised {{current_date}} &middot; <a href="{{dashboard_url}}">Open dashboard</a></p>
      </td>
    </tr>
  </table>
</body>
</html>
"#;

const ALERT_TEXT: &str = r#"{{priority_icon}} {{subject}} [{{priority_label}}]
{{#if message}}
{{message}}
{{/if}}
{{#each details}}
{{label}}: {{value}}
{{/each}}
Raised {{current_date}}. Dashboard: {{dashboard_url}}
"#;

const GENERIC_HTML: &str = r#"<!DOCTYPE html>
<html lang="en">
<body style="margin: 0; padding: 0; font-family: -apple-system, 'Segoe UI', Roboto, sans-serif;">
  <table role="presentation" width="100%" cellspacing="0" cellpadding="0" style="max-width: 600px; margin: 0 auto; padding: 32px 16px;">
    <tr>
      <td>
        <h1 style="color: #18181b; font-size: 20px;">{{subject}}</h1>
        {{#each details}}
        <p style="color: #52525b; font-size: 14px; margin: 4px 0;"><strong>{{label}}:</strong> {{value}}</p>
        {{/each}}
        <p style="color: #a1a1aa; font-size: 12px;">{{company_name}} &middot; {{current_date}}</p>
      </td>
    </tr>
  </table>
</body>
</html>
"#;

const GENERIC_TEXT: &str = r#"{{subject}}
{{#each details}}
{{label}}: {{value}}
{{/each}}
--
{{company_name}} | {{current_date}}
"#;

#[cfg(test)]
mod tests {
    use super::*;

    fn renderer() -> TemplateRenderer {
        TemplateRenderer::new(TemplateConfig::default())
    }

    fn data(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_route_resolution() {
        let route = resolve_route("inquiry-business");
        assert_eq!(route.template_id, "business-inquiry");
        assert_eq!(route.subject, "New Business Inquiry Received");

        let fallback = resolve_route("something-new");
        assert_eq!(fallback.template_id, DEFAULT_TEMPLATE_ID);
        assert_eq!(fallback.subject, DEFAULT_SUBJECT);
    }

    #[test]
    fn test_every_built_in_template_is_valid() {
        for route in ROUTES.iter().chain(std::iter::once(&DEFAULT_ROUTE)) {
            let template = built_in_template(route.template_id).unwrap();
            assert!(TemplateRenderer::validate_template(&template).is_ok(), "{}", route.template_id);
        }
    }

    #[test]
    fn test_load_unknown_template_is_not_found() {
        assert_eq!(
            renderer().load_template("nope").unwrap_err(),
            RenderError::NotFound("nope".into())
        );
    }

    #[test]
    fn test_load_is_cached() {
        let renderer = renderer();
        let first = renderer.load_template("system-alert").unwrap();
        let second = renderer.load_template("system-alert").unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        renderer.clear_cache().unwrap();
        let third = renderer.load_template("system-alert").unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
    }

    #[test]
    fn test_render_enriches_and_is_deterministic() {
        let renderer = renderer();
        let data = data(&[
            ("entity_id", json!("biz-1")),
            ("priority", json!("urgent")),
            ("timestamp", json!("2025-03-04T10:00:00Z")),
        ]);

        let first = renderer.render("business-inquiry", &data).unwrap();
        let second = renderer.render("business-inquiry", &data).unwrap();

        assert_eq!(first, second);
        assert_eq!(first.subject, "New Business Inquiry Received");
        assert!(first.html.contains("biz-1"));
        assert!(first.html.contains(Priority::Urgent.color()));
        assert!(first.text.contains("March 4, 2025"));
        assert!(first.text.contains("https://admin.example.org/entities/biz-1"));
    }

    #[test]
    fn test_missing_required_variable_fails() {
        let err = renderer()
            .render("business-inquiry", &Map::new())
            .unwrap_err();
        assert_eq!(
            err,
            RenderError::MissingVariable {
                template: "business-inquiry".into(),
                variable: "entity_id".into()
            }
        );
    }

    #[test]
    fn test_html_is_escaped_text_is_not() {
        let renderer = renderer();
        let data = data(&[("message", json!("disk <90%> & rising"))]);

        let rendered = renderer.render("system-alert", &data).unwrap();
        assert!(rendered.html.contains("disk &lt;90%&gt; &amp; rising"));
        assert!(rendered.text.contains("disk <90%> & rising"));
    }

    #[test]
    fn test_validate_template_rejects_bad_shapes() {
        let mut template = built_in_template("system-alert").unwrap();
        template.body_html = None;
        template.body_text = Some("   ".into());
        assert!(TemplateRenderer::validate_template(&template).is_err());

        let mut template = built_in_template("system-alert").unwrap();
        template.body_html = Some("{{#if broken}}".into());
        assert!(matches!(
            TemplateRenderer::validate_template(&template),
            Err(RenderError::InvalidTemplate { .. })
        ));

        let mut template = built_in_template("system-alert").unwrap();
        template.subject = String::new();
        assert!(TemplateRenderer::validate_template(&template).is_err());
    }

    #[test]
    fn test_render_survives_concurrent_cache_clears() {
        let renderer = Arc::new(renderer());
        let data = data(&[("entity_id", json!("biz-1"))]);

        let clearer = {
            let renderer = Arc::clone(&renderer);
            std::thread::spawn(move || {
                for _ in 0..2_000 {
                    renderer.clear_cache().unwrap();
                }
            })
        };

        let renders: Vec<_> = (0..4)
            .map(|_| {
                let renderer = Arc::clone(&renderer);
                let data = data.clone();
                std::thread::spawn(move || {
                    (0..500)
                        .filter(|_| renderer.render("business-inquiry", &data).is_err())
                        .count()
                })
            })
            .collect();

        clearer.join().unwrap();
        let errors: usize = renders.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(errors, 0);
    }

    #[test]
    fn test_registered_template_overrides_built_in() {
        let renderer = renderer();
        renderer.load_template("system-alert").unwrap();

        renderer
            .register_template(Template {
                id: "system-alert".into(),
                event_type: "system-alert".into(),
                subject: "Alert: {{code}}".into(),
                body_html: None,
                body_text: Some("code {{code}} at {{company_name}}".into()),
                variables: vec!["code".into()],
            })
            .unwrap();

        let rendered = renderer
            .render("system-alert", &data(&[("code", json!("E42"))]))
            .unwrap();
        assert_eq!(rendered.subject, "Alert: E42");
        assert_eq!(rendered.text, "code E42 at Foundation");
        assert!(rendered.html.is_empty());
    }
}
