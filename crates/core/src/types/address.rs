//! Postal addresses used for shipping groups, orders and payment billing details.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Address fields that can be reported as missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressField {
    FirstName,
    LastName,
    Line1,
    City,
    Postcode,
    Country,
}

impl AddressField {
    /// Wire name of the field.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::FirstName => "first_name",
            Self::LastName => "last_name",
            Self::Line1 => "line_1",
            Self::City => "city",
            Self::Postcode => "postcode",
            Self::Country => "country",
        }
    }
}

impl fmt::Display for AddressField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An address is missing one or more required fields.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("missing required address fields: {}", join_fields(.missing))]
pub struct AddressError {
    /// Every required field that was blank, in declaration order.
    pub missing: Vec<AddressField>,
}

fn join_fields(fields: &[AddressField]) -> String {
    fields
        .iter()
        .map(|f| f.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// A postal address in the commerce platform's shape.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company_name: Option<String>,
    #[serde(default)]
    pub line_1: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_2: Option<String>,
    #[serde(default)]
    pub city: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub county: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default)]
    pub postcode: String,
    /// ISO 3166-1 alpha-2 country code.
    #[serde(default)]
    pub country: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

impl Address {
    /// Check the minimum field set needed to ship to this address.
    ///
    /// # Errors
    ///
    /// Returns an [`AddressError`] listing every blank required field.
    pub fn validate(&self) -> Result<(), AddressError> {
        let required = [
            (AddressField::FirstName, &self.first_name),
            (AddressField::LastName, &self.last_name),
            (AddressField::Line1, &self.line_1),
            (AddressField::City, &self.city),
            (AddressField::Postcode, &self.postcode),
            (AddressField::Country, &self.country),
        ];

        let missing: Vec<_> = required
            .into_iter()
            .filter(|(_, value)| value.trim().is_empty())
            .map(|(field, _)| field)
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(AddressError { missing })
        }
    }

    /// "First Last" for display and payment billing details.
    #[must_use]
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name.trim(), self.last_name.trim())
            .trim()
            .to_string()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn complete() -> Address {
        Address {
            first_name: "Ada".into(),
            last_name: "Lovelace".into(),
            line_1: "12 Marylebone Rd".into(),
            city: "London".into(),
            postcode: "NW1 5LR".into(),
            country: "GB".into(),
            ..Address::default()
        }
    }

    #[test]
    fn test_complete_address_is_valid() {
        assert!(complete().validate().is_ok());
    }

    #[test]
    fn test_reports_every_missing_field() {
        let address = Address {
            first_name: "Ada".into(),
            line_1: "  ".into(),
            ..Address::default()
        };
        let err = address.validate().unwrap_err();
        assert_eq!(
            err.missing,
            vec![
                AddressField::LastName,
                AddressField::Line1,
                AddressField::City,
                AddressField::Postcode,
                AddressField::Country,
            ]
        );
        assert_eq!(
            err.to_string(),
            "missing required address fields: last_name, line_1, city, postcode, country"
        );
    }

    #[test]
    fn test_optional_fields_skipped_when_serializing() {
        let json = serde_json::to_value(complete()).unwrap();
        assert!(json.get("line_2").is_none());
        assert_eq!(json["line_1"], "12 Marylebone Rd");
    }

    #[test]
    fn test_full_name() {
        assert_eq!(complete().full_name(), "Ada Lovelace");
    }
}
