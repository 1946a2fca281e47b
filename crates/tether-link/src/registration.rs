//! Capability probe and tool registration against the host's registrar.

use crate::channel::Channel;
use tether_types::{LinkError, ToolRegistration, ToolResult};

/// Name of the host tool that accepts registrations.
pub const REGISTRAR_TOOL: &str = "remote";

/// Text the registrar returns on success.
pub const REGISTRATION_SUCCESS_MARKER: &str = "Successfully registered tool";

/// Confirm the host exposes the registrar tool.
pub async fn verify_registrar(channel: &Channel) -> Result<(), LinkError> {
    let tools = channel.list_tools().await?;
    tracing::debug!("Host exposes {} tool(s)", tools.len());

    if tools.iter().any(|t| t.name == REGISTRAR_TOOL) {
        Ok(())
    } else {
        Err(LinkError::RegistrarMissing {
            tool: REGISTRAR_TOOL.to_string(),
        })
    }
}

/// Build the `arguments` object for a registration call.
pub fn registration_arguments(
    registration: &ToolRegistration,
) -> Result<serde_json::Value, serde_json::Error> {
    let mut input = serde_json::to_value(registration)?;
    if let Some(obj) = input.as_object_mut() {
        obj.insert("operation".into(), serde_json::json!("register"));
    }
    Ok(serde_json::json!({ "input": input }))
}

/// Check a registrar reply for the success marker.
pub fn check_registration(result: &ToolResult) -> Result<(), LinkError> {
    let text = result.first_text().unwrap_or_default();
    if !result.is_error && text.contains(REGISTRATION_SUCCESS_MARKER) {
        Ok(())
    } else if text.is_empty() {
        Err(LinkError::RegistrationRejected(
            "registrar returned no text content".to_string(),
        ))
    } else {
        Err(LinkError::RegistrationRejected(text.to_string()))
    }
}

/// Register the tool with the host.
pub async fn register(channel: &Channel, registration: &ToolRegistration) -> Result<(), LinkError> {
    let arguments = registration_arguments(registration)?;
    let result = channel
        .call_tool_with_timeout(REGISTRAR_TOOL, arguments, channel.options().request_timeout)
        .await?;
    check_registration(&result)?;
    tracing::info!("Registered tool '{}'", registration.tool_name);
    Ok(())
}
