//! Ownership taxonomy normalisation.
//!
//! Source records carry two independent agency-type codes: who owns the land
//! and who manages it. Both draw from the same closed code space, which is
//! mapped onto the five canonical [`OwnerClass`] values by exhaustive matches.

use std::str::FromStr;

use crate::model::OwnerClass;

/// Agency-type code as used by the owner-type and manager-type fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgencyType {
    Federal,
    Tribal,
    State,
    Territorial,
    Local,
    /// Regional agency special district
    District,
    Joint,
    Ngo,
    Private,
    Designation,
    Unknown,
}

impl FromStr for AgencyType {
    type Err = UnrecognizedCode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let code = s.trim().to_ascii_uppercase();
        let agency = match code.as_str() {
            "FED" | "FEDERAL" | "BLM" | "USFS" | "NPS" | "FWS" | "USFWS" | "DOD" | "BOR" => {
                AgencyType::Federal
            }
            "TRIB" | "TRIBAL" | "NATIVE" => AgencyType::Tribal,
            "STAT" | "STATE" => AgencyType::State,
            "TERR" | "TERRITORIAL" => AgencyType::Territorial,
            "LOC" | "LOCAL" | "COUNTY" | "CITY" | "MUNICIPAL" => AgencyType::Local,
            "DIST" | "REGIONAL" | "DISTRICT" => AgencyType::District,
            "JNT" | "JOINT" => AgencyType::Joint,
            "NGO" => AgencyType::Ngo,
            "PVT" | "PRIVATE" => AgencyType::Private,
            "DESG" | "DESIGNATION" => AgencyType::Designation,
            "UNK" | "UNKNOWN" => AgencyType::Unknown,
            _ => return Err(UnrecognizedCode(s.to_string())),
        };
        Ok(agency)
    }
}

/// A raw code outside the documented code space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnrecognizedCode(pub String);

/// The same mapping applies to both the owner-type and the manager-type code.
impl From<AgencyType> for OwnerClass {
    fn from(agency: AgencyType) -> Self {
        match agency {
            AgencyType::Federal => OwnerClass::Federal,
            AgencyType::State | AgencyType::Territorial => OwnerClass::State,
            AgencyType::Local | AgencyType::District => OwnerClass::Local,
            AgencyType::Tribal => OwnerClass::Tribal,
            AgencyType::Joint
            | AgencyType::Ngo
            | AgencyType::Private
            | AgencyType::Designation
            | AgencyType::Unknown => OwnerClass::OtherPublic,
        }
    }
}

/// Which input decided a classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassSource {
    Manager,
    Owner,
    Default,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub owner_class: OwnerClass,
    pub decided_by: ClassSource,
    /// Count of supplied codes that were outside the code space
    pub unrecognized_codes: u8,
}

/// Classify a record from its raw owner-type and manager-type codes.
///
/// A manager mapping wins when it yields something other than the catch-all;
/// the owner mapping comes next, and `other_public` is the final default.
/// Never fails: unknown or missing codes fall through to the default.
pub fn classify(owner_code: Option<&str>, manager_code: Option<&str>) -> Classification {
    let mut unrecognized_codes = 0;
    let mut parse = |code: Option<&str>| -> Option<AgencyType> {
        let code = code.map(str::trim).filter(|c| !c.is_empty())?;
        match code.parse::<AgencyType>() {
            Ok(agency) => Some(agency),
            Err(_) => {
                unrecognized_codes += 1;
                None
            }
        }
    };
    let owner = parse(owner_code).map(OwnerClass::from);
    let manager = parse(manager_code).map(OwnerClass::from);

    let (owner_class, decided_by) = match (manager, owner) {
        (Some(class), _) if class != OwnerClass::OtherPublic => (class, ClassSource::Manager),
        (_, Some(class)) => (class, ClassSource::Owner),
        (Some(class), None) => (class, ClassSource::Manager),
        (None, None) => (OwnerClass::OtherPublic, ClassSource::Default),
    };

    Classification {
        owner_class,
        decided_by,
        unrecognized_codes,
    }
}
