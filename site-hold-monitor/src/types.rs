use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Site {
    pub id: Uuid,
    pub name: String,
    pub lat: f64,
    pub lng: f64,
    pub zone_id: String,
    pub active: bool,
    pub radius_m: Option<f64>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WeatherSnapshot {
    pub timestamp: String,
    pub wind_speed_mph: f64,
    pub wind_gust_mph: f64,
    pub apparent_temp_c: f64,
    pub weather_code: i32,
    pub lightning_probability_pct: u8,
    // Provider payload kept verbatim for audit.
    #[serde(default)]
    pub raw: serde_json::Value,
}

/// Hold-triggering rules, declared in priority order (highest first).
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Rule {
    #[serde(rename = "LIGHTNING_30_30")]
    Lightning3030,
    HighWindGeneral,
    HighWindMaterialHandling,
    ExtremeHeat,
}

impl Rule {
    pub fn as_str(&self) -> &'static str {
        match self {
            Rule::Lightning3030 => "LIGHTNING_30_30",
            Rule::HighWindGeneral => "HIGH_WIND_GENERAL",
            Rule::HighWindMaterialHandling => "HIGH_WIND_MATERIAL_HANDLING",
            Rule::ExtremeHeat => "EXTREME_HEAT",
        }
    }

    pub fn parse(s: &str) -> Option<Rule> {
        match s {
            "LIGHTNING_30_30" => Some(Rule::Lightning3030),
            "HIGH_WIND_GENERAL" => Some(Rule::HighWindGeneral),
            "HIGH_WIND_MATERIAL_HANDLING" => Some(Rule::HighWindMaterialHandling),
            "EXTREME_HEAT" => Some(Rule::ExtremeHeat),
            _ => None,
        }
    }

    /// Human readable label used in operator messages.
    pub fn label(&self) -> &'static str {
        match self {
            Rule::Lightning3030 => "Lightning / Thunderstorm (30/30 Rule)",
            Rule::HighWindGeneral => "High Wind \u{2014} General",
            Rule::HighWindMaterialHandling => "High Wind \u{2014} Material Handling",
            Rule::ExtremeHeat => "Extreme Heat (apparent temperature)",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ThresholdBreach {
    pub rule: Rule,
    pub value: f64,
    pub threshold: f64,
    /// `None` means the hold clears only once the condition drops below threshold.
    pub hold_duration_mins: Option<u32>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct VehicleOnSite {
    pub device_id: String,
    pub device_name: String,
    #[serde(default)]
    pub is_equipment: bool,
    pub driver_id: Option<String>,
    pub driver_name: Option<String>,
    pub phone_number: Option<String>,
    pub lat: f64,
    pub lng: f64,
    pub speed: f64,
    pub date_time: Option<DateTime<Utc>>,
}

impl VehicleOnSite {
    pub fn display_name(&self) -> &str {
        self.driver_name.as_deref().unwrap_or(&self.device_name)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Hold,
    AllClear,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Hold => "hold",
            MessageKind::AllClear => "all_clear",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct NotificationRecord {
    pub driver_name: Option<String>,
    pub device_id: String,
    pub contact: Option<String>,
    pub message_type: MessageKind,
    pub sent_at: DateTime<Utc>,
    pub provider_message_id: Option<String>,
    pub status: String,
}

impl NotificationRecord {
    pub fn is_sent(&self) -> bool {
        self.status == "sent"
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Hold {
    pub id: Uuid,
    pub site_id: Uuid,
    pub triggered_at: DateTime<Utc>,
    pub trigger_rule: Rule,
    pub weather_snapshot: WeatherSnapshot,
    pub vehicles_on_site: Vec<VehicleOnSite>,
    pub hold_duration_mins: Option<u32>,
    pub all_clear_at: Option<DateTime<Utc>>,
    pub issued_by: String,
    pub notifications_sent: Vec<NotificationRecord>,
}

impl Hold {
    pub fn is_open(&self) -> bool {
        self.all_clear_at.is_none()
    }
}
