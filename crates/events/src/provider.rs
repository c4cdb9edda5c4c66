use core::str::FromStr;

use serde::{Deserialize, Serialize};

use tenantflow_core::DomainError;

/// External webhook provider.
///
/// This is a closed set: every provider has exactly one verifier, one parser
/// and one handler slot, so adding a provider is a compile-time change.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    Stripe,
    Twilio,
    Whatsapp,
    Email,
}

impl Provider {
    pub const ALL: [Provider; 4] = [
        Provider::Stripe,
        Provider::Twilio,
        Provider::Whatsapp,
        Provider::Email,
    ];

    /// Stable name, used as the idempotency `source` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Stripe => "stripe",
            Provider::Twilio => "twilio",
            Provider::Whatsapp => "whatsapp",
            Provider::Email => "email",
        }
    }
}

impl core::fmt::Display for Provider {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "stripe" => Ok(Provider::Stripe),
            "twilio" => Ok(Provider::Twilio),
            "whatsapp" => Ok(Provider::Whatsapp),
            "email" => Ok(Provider::Email),
            other => Err(DomainError::validation(format!("unknown provider: {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_parse_back() {
        for provider in Provider::ALL {
            assert_eq!(provider.as_str().parse::<Provider>().unwrap(), provider);
        }
        assert!("WhatsApp".parse::<Provider>().is_ok());
        assert!("slack".parse::<Provider>().is_err());
    }
}
