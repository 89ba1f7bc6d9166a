use std::fmt;
use std::str::FromStr;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::IngestError;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    #[value(name = "worldbank")]
    WorldBank,
    #[value(name = "unsdg")]
    UnSdg,
    #[value(name = "ndgain")]
    NdGain,
    Hdr,
    Owid,
}

impl SourceKind {
    pub const ALL: [SourceKind; 5] = [
        SourceKind::WorldBank,
        SourceKind::UnSdg,
        SourceKind::NdGain,
        SourceKind::Hdr,
        SourceKind::Owid,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::WorldBank => "worldbank",
            SourceKind::UnSdg => "unsdg",
            SourceKind::NdGain => "ndgain",
            SourceKind::Hdr => "hdr",
            SourceKind::Owid => "owid",
        }
    }

    pub fn is_api(&self) -> bool {
        matches!(
            self,
            SourceKind::WorldBank | SourceKind::UnSdg | SourceKind::Hdr
        )
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = IngestError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "worldbank" | "world_bank" => Ok(SourceKind::WorldBank),
            "unsdg" | "un_sdg" => Ok(SourceKind::UnSdg),
            "ndgain" | "nd_gain" => Ok(SourceKind::NdGain),
            "hdr" => Ok(SourceKind::Hdr),
            "owid" => Ok(SourceKind::Owid),
            _ => Err(IngestError::UnknownSource(value.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct YearSelection {
    #[serde(default)]
    pub start_year: Option<i32>,
    #[serde(default)]
    pub end_year: Option<i32>,
    #[serde(default)]
    pub years: Option<Vec<i32>>,
}

impl YearSelection {
    pub fn range(start_year: i32, end_year: i32) -> Self {
        Self {
            start_year: Some(start_year),
            end_year: Some(end_year),
            years: None,
        }
    }

    pub fn resolve(&self) -> Result<Vec<i32>, String> {
        if let Some(years) = &self.years {
            if years.is_empty() {
                return Err("years list is empty".to_string());
            }
            return Ok(years.clone());
        }
        match (self.start_year, self.end_year) {
            (Some(start), Some(end)) if start <= end => Ok((start..=end).collect()),
            (Some(start), Some(end)) => Err(format!(
                "start_year ({start}) must not be after end_year ({end})"
            )),
            _ => Err("either years or start_year/end_year is required".to_string()),
        }
    }

    pub fn bounds(&self) -> Result<(i32, i32), String> {
        let years = self.resolve()?;
        let min = years.iter().copied().min().unwrap_or_default();
        let max = years.iter().copied().max().unwrap_or_default();
        Ok((min, max))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IndicatorEntry {
    Shorthand(String),
    Detailed(IndicatorAlias),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndicatorAlias {
    pub code: String,
    #[serde(default)]
    pub alias: Option<String>,
}

impl IndicatorEntry {
    pub fn code(&self) -> &str {
        match self {
            IndicatorEntry::Shorthand(code) => code,
            IndicatorEntry::Detailed(obj) => &obj.code,
        }
    }

    pub fn alias(&self) -> &str {
        match self {
            IndicatorEntry::Shorthand(code) => code,
            IndicatorEntry::Detailed(obj) => obj.alias.as_deref().unwrap_or(&obj.code),
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn parse_source_kind() {
        assert_eq!("worldbank".parse::<SourceKind>().unwrap(), SourceKind::WorldBank);
        assert_eq!("UN_SDG".parse::<SourceKind>().unwrap(), SourceKind::UnSdg);
        let err = "eurostat".parse::<SourceKind>().unwrap_err();
        assert_matches!(err, IngestError::UnknownSource(_));
    }

    #[test]
    fn source_kind_display_round_trips() {
        for kind in SourceKind::ALL {
            assert_eq!(kind.to_string().parse::<SourceKind>().unwrap(), kind);
        }
    }

    #[test]
    fn explicit_years_win_over_range() {
        let selection = YearSelection {
            start_year: Some(2000),
            end_year: Some(2002),
            years: Some(vec![2015, 2010]),
        };
        assert_eq!(selection.resolve().unwrap(), vec![2015, 2010]);
        assert_eq!(selection.bounds().unwrap(), (2010, 2015));
    }

    #[test]
    fn inverted_range_is_rejected() {
        assert!(YearSelection::range(2020, 2010).resolve().is_err());
        assert_eq!(YearSelection::range(2010, 2012).resolve().unwrap(), vec![2010, 2011, 2012]);
    }

    #[test]
    fn indicator_entry_alias_defaults_to_code() {
        let short = IndicatorEntry::Shorthand("SP.POP.TOTL".to_string());
        assert_eq!(short.alias(), "SP.POP.TOTL");
        let detailed = IndicatorEntry::Detailed(IndicatorAlias {
            code: "SE.ADT.LITR.ZS".to_string(),
            alias: Some("literacy_rate".to_string()),
        });
        assert_eq!(detailed.code(), "SE.ADT.LITR.ZS");
        assert_eq!(detailed.alias(), "literacy_rate");
    }
}
