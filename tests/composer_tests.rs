use std::{fs, sync::Arc};

use anyhow::Result;
use mail_dispatch::{
    clients::template::FileTemplates,
    config::Environment,
    error::RenderError,
    mailer::{MessageComposer, composer::TEST_EMAIL_MARKER},
    models::request::{NotificationPayload, Sender},
};
use tempfile::TempDir;

fn template_tree() -> Result<TempDir> {
    let dir = tempfile::tempdir()?;

    let global = dir.path().join("mailers/Welcome");
    fs::create_dir_all(&global)?;
    fs::write(
        global.join("index.html"),
        "<p>{{isTestEmail}}</p><h1>Hello {{name}}</h1><p>Locale: {{locale}}</p>",
    )?;

    let scoped = dir.path().join("app/Admin/mailers/Invite");
    fs::create_dir_all(&scoped)?;
    fs::write(scoped.join("index.html"), "<p>Admin invite for {{name}}</p>")?;

    Ok(dir)
}

fn composer(dir: &TempDir, environment: Environment) -> MessageComposer {
    MessageComposer::new(Arc::new(FileTemplates::new(dir.path())), environment, "en")
}

fn request(template: &str) -> NotificationPayload {
    NotificationPayload::new(Sender::new("a@good.com", "A"), "Hi", template)
        .with_to("x@test.com")
        .with_arg("name", "Ada")
}

/// Test: Global templates render with the test marker outside production
#[tokio::test]
async fn test_global_template_with_test_marker() -> Result<()> {
    let dir = template_tree()?;
    let request = request("Welcome").validate()?;

    let content = composer(&dir, Environment::Staging).compose(&request).await?;

    assert_eq!(content.subject, "Hi");
    assert!(content.html.contains(TEST_EMAIL_MARKER));
    assert!(content.html.contains("Hello Ada"));
    assert!(content.html.contains("Locale: en"));
    assert_eq!(
        content.text,
        format!("{}\n\nHello Ada\n\nLocale: en", TEST_EMAIL_MARKER)
    );

    Ok(())
}

/// Test: Production output carries no test marker
#[tokio::test]
async fn test_production_has_empty_marker() -> Result<()> {
    let dir = template_tree()?;
    let request = request("Welcome").validate()?;

    let content = composer(&dir, Environment::Production)
        .compose(&request)
        .await?;

    assert!(!content.html.contains(TEST_EMAIL_MARKER));
    assert!(content.html.starts_with("<p></p>"));

    Ok(())
}

/// Test: Caller-supplied locale wins over the default, the marker does not
#[tokio::test]
async fn test_caller_locale_is_kept() -> Result<()> {
    let dir = template_tree()?;
    let request = request("Welcome")
        .with_arg("locale", "fr")
        .with_arg("isTestEmail", "spoofed")
        .validate()?;

    let content = composer(&dir, Environment::Production)
        .compose(&request)
        .await?;

    assert!(content.html.contains("Locale: fr"));
    assert!(!content.html.contains("spoofed"));

    Ok(())
}

/// Test: Scoped templates resolve under their feature directory
#[tokio::test]
async fn test_scoped_template() -> Result<()> {
    let dir = template_tree()?;
    let request = request("Admin.Invite").validate()?;

    let content = composer(&dir, Environment::Development)
        .compose(&request)
        .await?;

    assert_eq!(content.text, "Admin invite for Ada");

    Ok(())
}

/// Test: Unknown templates and missing arguments are render errors
#[tokio::test]
async fn test_render_failures() -> Result<()> {
    let dir = template_tree()?;
    let composer = composer(&dir, Environment::Development);

    let missing = request("Nope").validate()?;
    assert!(matches!(
        composer.compose(&missing).await,
        Err(RenderError::NotFound(name)) if name == "Nope"
    ));

    let no_name = NotificationPayload::new(Sender::new("a@good.com", "A"), "Hi", "Welcome")
        .with_to("x@test.com")
        .validate()?;
    assert!(matches!(
        composer.compose(&no_name).await,
        Err(RenderError::MissingVariable(key)) if key == "name"
    ));

    Ok(())
}
