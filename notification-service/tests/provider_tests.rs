use anyhow::Result;
use notification_service::{
    clients::providers::{ChatProvider, EmailProvider, ProviderClient, SmsProvider},
    config::{ChatConfig, EmailConfig, SmsConfig},
    error::ProviderError,
    models::{
        message::RenderedMessage,
        provider::ProviderOutcome,
        request::{NotificationRequest, Priority},
        status::DeliveryState,
    },
};
use serde_json::json;
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{body_partial_json, body_string_contains, header, method, path},
};

fn message() -> RenderedMessage {
    let request = NotificationRequest::new(
        "msg-100",
        "sub-9",
        "system-alert",
        vec!["ops@example.com".to_string()],
    )
    .with_priority(Priority::Urgent);

    RenderedMessage::new(
        &request,
        "system-alert",
        "System Alert".to_string(),
        "<p>Disk almost full</p>".to_string(),
        "Disk almost full".to_string(),
    )
}

fn email(server: &MockServer) -> Result<EmailProvider> {
    Ok(EmailProvider::new(EmailConfig {
        api_url: server.uri(),
        api_key: "sg-key".to_string(),
        from_address: "noreply@example.org".to_string(),
        timeout_ms: 2_000,
        ..Default::default()
    })?)
}

fn sms(server: &MockServer) -> Result<SmsProvider> {
    Ok(SmsProvider::new(SmsConfig {
        enabled: true,
        api_url: server.uri(),
        account_sid: "AC123".to_string(),
        auth_token: "token".to_string(),
        from_number: "+15550001111".to_string(),
        timeout_ms: 2_000,
    })?)
}

fn chat(server: &MockServer) -> Result<ChatProvider> {
    Ok(ChatProvider::new(ChatConfig {
        enabled: true,
        webhook_url: format!("{}/hooks/T000", server.uri()),
        timeout_ms: 2_000,
        ..Default::default()
    })?)
}

/// Test: Email send posts one personalization per recipient and returns the provider id
#[tokio::test]
async fn test_email_send_returns_provider_id() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/mail/send"))
        .and(header("authorization", "Bearer sg-key"))
        .and(body_partial_json(json!({
            "subject": "System Alert",
            "custom_args": {"message_id": "msg-100", "subscriber_id": "sub-9"}
        })))
        .respond_with(ResponseTemplate::new(202).insert_header("x-message-id", "sg-abc"))
        .expect(1)
        .mount(&server)
        .await;

    let receipt = email(&server)?
        .send(&message(), &["ops@example.com".to_string()])
        .await?;

    assert_eq!(receipt.provider_message_id, "sg-abc");
    assert_eq!(receipt.outcome, ProviderOutcome::Accepted);

    Ok(())
}

/// Test: Email API errors are mapped by status and field
#[tokio::test]
async fn test_email_errors_are_mapped() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/mail/send"))
        .and(body_string_contains("broken"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "errors": [{"message": "Does not contain a valid address.", "field": "personalizations.0.to"}]
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/mail/send"))
        .respond_with(ResponseTemplate::new(503).set_body_string("unavailable"))
        .mount(&server)
        .await;

    let provider = email(&server)?;

    let invalid = provider
        .send(&message(), &["broken".to_string()])
        .await
        .unwrap_err();
    assert!(matches!(invalid, ProviderError::InvalidRecipient(_)));

    let unavailable = provider
        .send(&message(), &["ops@example.com".to_string()])
        .await
        .unwrap_err();
    assert!(matches!(unavailable, ProviderError::Server { status: 503, .. }));

    Ok(())
}

/// Test: Email delivery status is read from the message activity
#[tokio::test]
async fn test_email_delivery_status() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/messages/sg-abc"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "bounced",
            "to_email": "ops@example.com"
        })))
        .mount(&server)
        .await;

    let report = email(&server)?.get_delivery_status("sg-abc").await?;
    assert_eq!(report.status, DeliveryState::Bounced);
    assert_eq!(report.recipient.as_deref(), Some("ops@example.com"));
    assert!(report.error.is_some());

    Ok(())
}

/// Test: SMS sends each number separately and records rejected numbers on the receipt
#[tokio::test]
async fn test_sms_partial_rejection() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/Accounts/AC123/Messages.json"))
        .and(body_string_contains("To=%2B15550002222"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "sid": "SM1",
            "status": "queued"
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/Accounts/AC123/Messages.json"))
        .and(body_string_contains("To=%2B15550003333"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "code": 21211,
            "message": "Invalid 'To' Phone Number"
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/Accounts/AC123/Messages.json"))
        .and(body_string_contains("To=%2B15550004444"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "sid": "SM2",
            "status": "queued"
        })))
        .mount(&server)
        .await;

    let receipt = sms(&server)?
        .send(
            &message(),
            &[
                "+15550002222".to_string(),
                "+15550003333".to_string(),
                "+15550004444".to_string(),
            ],
        )
        .await?;

    assert_eq!(receipt.provider_message_id, "SM1");
    assert_eq!(receipt.rejected.len(), 1);
    assert_eq!(receipt.rejected[0].recipient, "+15550003333");

    // every accepted number keeps the sid its callbacks will carry
    assert_eq!(receipt.provider_id_for("+15550002222"), "SM1");
    assert_eq!(receipt.provider_id_for("+15550004444"), "SM2");

    Ok(())
}

/// Test: An SMS server error aborts the batch so the whole message is retried
#[tokio::test]
async fn test_sms_server_error_aborts() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/Accounts/AC123/Messages.json"))
        .respond_with(ResponseTemplate::new(500).set_body_json(json!({
            "message": "internal"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let error = sms(&server)?
        .send(
            &message(),
            &["+15550002222".to_string(), "+15550003333".to_string()],
        )
        .await
        .unwrap_err();
    assert!(matches!(error, ProviderError::Server { status: 500, .. }));

    Ok(())
}

/// Test: Chat webhook posts are delivered synchronously
#[tokio::test]
async fn test_chat_webhook_delivered() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/hooks/T000"))
        .respond_with(ResponseTemplate::new(405))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/hooks/T000"))
        .and(body_partial_json(json!({"channel": "#ops"})))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .expect(1)
        .mount(&server)
        .await;

    let provider = chat(&server)?;
    provider.initialize().await?;

    let receipt = provider.send(&message(), &["#ops".to_string()]).await?;
    assert_eq!(receipt.outcome, ProviderOutcome::Delivered);
    assert!(receipt.provider_message_id.starts_with("chat-"));

    Ok(())
}

/// Test: Unknown chat destinations are invalid recipients
#[tokio::test]
async fn test_chat_unknown_destination() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hooks/T000"))
        .respond_with(ResponseTemplate::new(404).set_body_string("channel_not_found"))
        .mount(&server)
        .await;

    let error = chat(&server)?
        .send(&message(), &["#missing".to_string()])
        .await
        .unwrap_err();

    assert!(matches!(error, ProviderError::InvalidRecipient(_)));
    assert!(error.to_string().contains("Invalid chat destination"));

    Ok(())
}

/// Test: A revoked chat webhook fails initialization and reports unhealthy
#[tokio::test]
async fn test_chat_revoked_webhook_is_unhealthy() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/hooks/T000"))
        .respond_with(ResponseTemplate::new(404).set_body_string("no_service"))
        .mount(&server)
        .await;

    let provider = chat(&server)?;
    assert!(!provider.health_check().await?);

    let error = provider.initialize().await.unwrap_err();
    assert!(matches!(error, ProviderError::Config(_)));

    Ok(())
}
