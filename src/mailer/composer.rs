use std::sync::Arc;

use tracing::debug;

use crate::{
    clients::template::TemplateRenderer,
    config::Environment,
    error::RenderError,
    models::{message::RenderedContent, request::NotificationRequest},
    utils::html_to_text,
};

pub const TEST_EMAIL_MARKER: &str = "THIS IS A TEST EMAIL";

/// Renders the body of a request: HTML from its template, plain text derived
/// from that HTML.
pub struct MessageComposer {
    renderer: Arc<dyn TemplateRenderer>,
    environment: Environment,
    default_locale: String,
}

impl MessageComposer {
    pub fn new(
        renderer: Arc<dyn TemplateRenderer>,
        environment: Environment,
        default_locale: impl Into<String>,
    ) -> Self {
        Self {
            renderer,
            environment,
            default_locale: default_locale.into(),
        }
    }

    pub async fn compose(
        &self,
        request: &NotificationRequest,
    ) -> Result<RenderedContent, RenderError> {
        let mut args = request.template_args().clone();

        let marker = if self.environment.is_production() {
            ""
        } else {
            TEST_EMAIL_MARKER
        };
        args.insert("isTestEmail".to_string(), marker.to_string());
        args.entry("locale".to_string())
            .or_insert_with(|| self.default_locale.clone());

        let html = self.renderer.render(request.template(), &args).await?;
        let text = html_to_text(&html);

        debug!(
            template = %request.template(),
            html_len = html.len(),
            text_len = text.len(),
            "Message composed"
        );

        Ok(RenderedContent {
            subject: request.subject().to_string(),
            html,
            text,
        })
    }
}
