use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

/// Customer class a meter is billed under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Residential,
    Commercial,
    Industrial,
    Public,
}

impl Category {
    pub const ALL: [Category; 4] = [
        Category::Residential,
        Category::Commercial,
        Category::Industrial,
        Category::Public,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Residential => "residential",
            Self::Commercial => "commercial",
            Self::Industrial => "industrial",
            Self::Public => "public",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "residential" => Ok(Self::Residential),
            "commercial" => Ok(Self::Commercial),
            "industrial" => Ok(Self::Industrial),
            "public" => Ok(Self::Public),
            other => Err(format!("unknown category '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MeterStatus {
    Active,
    Inactive,
}

impl FromStr for MeterStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" => Ok(Self::Active),
            "inactive" => Ok(Self::Inactive),
            other => Err(format!("unknown meter status '{other}'")),
        }
    }
}

/// Reference metadata owned by the meter registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meter {
    pub meter_id: String,
    pub region: String,
    pub category: Category,
    pub status: MeterStatus,
}

impl Meter {
    pub fn active(meter_id: impl Into<String>, region: impl Into<String>, category: Category) -> Self {
        Self {
            meter_id: meter_id.into(),
            region: region.into(),
            category,
            status: MeterStatus::Active,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_parses_case_insensitively() {
        assert_eq!("Industrial".parse::<Category>(), Ok(Category::Industrial));
        assert_eq!(" public ".parse::<Category>(), Ok(Category::Public));
        assert!("farm".parse::<Category>().is_err());
    }

    #[test]
    fn category_serializes_lowercase() {
        let json = serde_json::to_string(&Category::Commercial).unwrap();
        assert_eq!(json, "\"commercial\"");
    }
}
