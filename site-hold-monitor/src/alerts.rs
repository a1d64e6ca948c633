use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use reqwest::Client;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::config::TwilioConfig;
use crate::error::{SendError, StorageError};
use crate::fleet::FleetSessions;
use crate::storage::HoldStore;
use crate::types::{MessageKind, NotificationRecord, Rule, VehicleOnSite};

/// A delivery channel to vehicle operators.
#[async_trait]
pub trait Messenger: Send + Sync {
    /// Where this channel would deliver a message for `vehicle`, if anywhere.
    fn address_for(&self, vehicle: &VehicleOnSite) -> Option<String>;

    /// Delivers `body` and returns the provider's message id.
    async fn send(&self, address: &str, body: &str) -> Result<String, SendError>;
}

/// In-cab text messages through the fleet provider, addressed by device.
pub struct InCabMessenger {
    sessions: Arc<FleetSessions>,
}

impl InCabMessenger {
    pub fn new(sessions: Arc<FleetSessions>) -> Self {
        Self { sessions }
    }
}

#[async_trait]
impl Messenger for InCabMessenger {
    fn address_for(&self, vehicle: &VehicleOnSite) -> Option<String> {
        (!vehicle.device_id.is_empty()).then(|| vehicle.device_id.clone())
    }

    async fn send(&self, address: &str, body: &str) -> Result<String, SendError> {
        let api = self.sessions.api();
        let id = self
            .sessions
            .call_with_retry(|session| async move {
                api.send_text_message(&session, address, body).await
            })
            .await?;
        Ok(id)
    }
}

/// SMS through Twilio, addressed by the operator's normalized phone number.
pub struct TwilioSms {
    client: Client,
    config: TwilioConfig,
}

#[derive(Deserialize)]
struct TwilioMessage {
    sid: String,
}

impl TwilioSms {
    pub fn new(config: TwilioConfig, timeout: Duration) -> Result<Self, SendError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl Messenger for TwilioSms {
    fn address_for(&self, vehicle: &VehicleOnSite) -> Option<String> {
        vehicle.phone_number.clone()
    }

    async fn send(&self, address: &str, body: &str) -> Result<String, SendError> {
        let url = format!(
            "https://api.twilio.com/2010-04-01/Accounts/{}/Messages.json",
            self.config.account_sid
        );
        let response = self
            .client
            .post(&url)
            .basic_auth(&self.config.account_sid, Some(&self.config.auth_token))
            .form(&[
                ("To", address),
                ("From", self.config.from_number.as_str()),
                ("Body", body),
            ])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(SendError::HttpStatus(response.status().as_u16()));
        }
        let message: TwilioMessage = response.json().await?;
        Ok(message.sid)
    }
}

/// What the operators are being told about.
#[derive(Debug, Clone)]
pub struct HoldContext<'a> {
    pub hold_id: Uuid,
    pub site_name: &'a str,
    pub rule: Rule,
    pub hold_duration_mins: Option<u32>,
}

pub fn hold_message(ctx: &HoldContext<'_>, vehicle: &VehicleOnSite) -> String {
    let duration = match ctx.hold_duration_mins {
        Some(mins) => format!("Work must stop for at least {mins} minutes."),
        None => "Work must stop until conditions improve.".to_string(),
    };
    format!(
        "\u{26a0}\u{fe0f} WORK HOLD \u{2014} {}\nReason: {}\n{}\nVehicle: {}\nIssued at {} UTC",
        ctx.site_name,
        ctx.rule.label(),
        duration,
        vehicle.device_name,
        Utc::now().format("%H:%M"),
    )
}

pub fn all_clear_message(ctx: &HoldContext<'_>, vehicle: &VehicleOnSite) -> String {
    format!(
        "\u{2705} ALL CLEAR \u{2014} {}\n{} conditions have passed.\n\
         Work may resume. Please confirm with your site supervisor.\nVehicle: {}",
        ctx.site_name,
        ctx.rule.label(),
        vehicle.device_name,
    )
}

/// Sends one message per reachable vehicle and logs every attempt.
pub struct Dispatcher {
    messenger: Arc<dyn Messenger>,
    store: Arc<dyn HoldStore>,
}

impl Dispatcher {
    pub fn new(messenger: Arc<dyn Messenger>, store: Arc<dyn HoldStore>) -> Self {
        Self { messenger, store }
    }

    pub async fn send_hold_alerts(
        &self,
        ctx: &HoldContext<'_>,
        vehicles: &[VehicleOnSite],
    ) -> Result<Vec<NotificationRecord>, StorageError> {
        self.dispatch(ctx, MessageKind::Hold, vehicles).await
    }

    pub async fn send_all_clear_alerts(
        &self,
        ctx: &HoldContext<'_>,
        vehicles: &[VehicleOnSite],
    ) -> Result<Vec<NotificationRecord>, StorageError> {
        self.dispatch(ctx, MessageKind::AllClear, vehicles).await
    }

    /// Sends to every reachable vehicle at once. A failed delivery is
    /// recorded like any other; only a failure to persist a record aborts.
    async fn dispatch(
        &self,
        ctx: &HoldContext<'_>,
        kind: MessageKind,
        vehicles: &[VehicleOnSite],
    ) -> Result<Vec<NotificationRecord>, StorageError> {
        let targets: Vec<(&VehicleOnSite, String)> = vehicles
            .iter()
            .filter_map(|vehicle| {
                if vehicle.is_equipment {
                    tracing::warn!(
                        site = ctx.site_name,
                        device = %vehicle.device_name,
                        "Equipment cannot receive messages, skipping"
                    );
                    return None;
                }
                match self.messenger.address_for(vehicle) {
                    Some(address) => Some((vehicle, address)),
                    None => {
                        tracing::warn!(
                            site = ctx.site_name,
                            recipient = vehicle.display_name(),
                            "No contact for recipient, skipping"
                        );
                        None
                    }
                }
            })
            .collect();

        let records = join_all(
            targets
                .into_iter()
                .map(|(vehicle, address)| self.deliver(ctx, kind, vehicle, address)),
        )
        .await;

        for record in &records {
            self.store.log_notification(ctx.hold_id, record).await?;
        }
        Ok(records)
    }

    async fn deliver(
        &self,
        ctx: &HoldContext<'_>,
        kind: MessageKind,
        vehicle: &VehicleOnSite,
        address: String,
    ) -> NotificationRecord {
        let body = match kind {
            MessageKind::Hold => hold_message(ctx, vehicle),
            MessageKind::AllClear => all_clear_message(ctx, vehicle),
        };

        let (provider_message_id, status) = match self.messenger.send(&address, &body).await {
            Ok(id) => {
                tracing::info!(
                    site = ctx.site_name,
                    kind = kind.as_str(),
                    recipient = vehicle.display_name(),
                    message_id = %id,
                    "Notification sent"
                );
                (Some(id), "sent".to_string())
            }
            Err(e) => {
                tracing::error!(
                    site = ctx.site_name,
                    kind = kind.as_str(),
                    recipient = vehicle.display_name(),
                    address = %address,
                    error = %e,
                    "Notification failed"
                );
                (None, format!("failed: {e}"))
            }
        };

        NotificationRecord {
            driver_name: vehicle.driver_name.clone(),
            device_id: vehicle.device_id.clone(),
            contact: Some(address),
            message_type: kind,
            sent_at: Utc::now(),
            provider_message_id,
            status,
        }
    }
}
