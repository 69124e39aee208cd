//! Plate directory naming.
//!
//! Exported plate folders look like `S01000042__2021-05-14T13_44_30-Measurement 1`.
//! The part before `__` is the plate name: a role character, a two digit
//! plate number and a zero-padded six digit workflow id.

use std::path::Path;

/// Separator between the plate name and the export timestamp.
pub const NAME_SEPARATOR: &str = "__";

/// Width of the zero-padded workflow id at the end of a plate name.
pub const WORKFLOW_ID_WIDTH: usize = 6;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    #[error("plate name '{0}' is too short to contain a plate number and workflow id")]
    TooShort(String),
    #[error("plate name '{0}' does not start with a known role character")]
    UnknownRole(String),
    #[error("plate name '{0}' has a non-numeric plate number")]
    BadPlateNumber(String),
    #[error("plate name '{0}' has a non-numeric workflow id")]
    BadWorkflowId(String),
}

/// Plate layout, taken from the first character of the plate name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlateRole {
    /// `S`: 384-well assay plate.
    Assay384,
    /// `A`: 96-well assay plate.
    Assay96,
    /// `T`: 384-well titration plate.
    Titration,
}

impl PlateRole {
    pub fn from_char(c: char) -> Option<Self> {
        match c {
            'S' => Some(PlateRole::Assay384),
            'A' => Some(PlateRole::Assay96),
            'T' => Some(PlateRole::Titration),
            _ => None,
        }
    }

    pub fn as_char(self) -> char {
        match self {
            PlateRole::Assay384 => 'S',
            PlateRole::Assay96 => 'A',
            PlateRole::Titration => 'T',
        }
    }
}

/// Everything that can be read from a plate directory name without touching
/// the reference data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlateIdentity {
    pub plate_name: String,
    pub workflow_id: String,
    pub plate_number: u8,
    pub role: PlateRole,
    pub is_titration: bool,
}

impl PlateIdentity {
    pub fn parse(path: impl AsRef<Path>) -> Result<Self, IdentityError> {
        let plate_name = plate_name(path);
        let role = plate_name
            .chars()
            .next()
            .and_then(PlateRole::from_char)
            .ok_or_else(|| IdentityError::UnknownRole(plate_name.clone()))?;
        let workflow_id = workflow_id(&plate_name)?;
        let plate_number = plate_number(&plate_name)?;
        let is_titration = is_titration_plate(&plate_name);
        Ok(Self {
            plate_name,
            workflow_id,
            plate_number,
            role,
            is_titration,
        })
    }
}

/// Base name of `path` up to the first `__`.
///
/// `/data/S01000999__2021-01-01T00_00_00-Measurement 1` -> `S01000999`
pub fn plate_name(path: impl AsRef<Path>) -> String {
    let base = path
        .as_ref()
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    match base.split_once(NAME_SEPARATOR) {
        Some((name, _)) => name.to_string(),
        None => base,
    }
}

/// Trailing zero-padded workflow id of a plate name.
pub fn workflow_id(plate_name: &str) -> Result<String, IdentityError> {
    if !plate_name.is_ascii() || plate_name.len() < WORKFLOW_ID_WIDTH + 3 {
        return Err(IdentityError::TooShort(plate_name.to_string()));
    }
    let id = &plate_name[plate_name.len() - WORKFLOW_ID_WIDTH..];
    if !id.bytes().all(|b| b.is_ascii_digit()) {
        return Err(IdentityError::BadWorkflowId(plate_name.to_string()));
    }
    Ok(id.to_string())
}

/// Two digit plate number at characters 1-2.
pub fn plate_number(plate_name: &str) -> Result<u8, IdentityError> {
    let field = plate_name
        .get(1..3)
        .ok_or_else(|| IdentityError::TooShort(plate_name.to_string()))?;
    if !field.bytes().all(|b| b.is_ascii_digit()) {
        return Err(IdentityError::BadPlateNumber(plate_name.to_string()));
    }
    field
        .parse()
        .map_err(|_| IdentityError::BadPlateNumber(plate_name.to_string()))
}

/// Titration plates are `T` followed by digits only.
pub fn is_titration_plate(plate_name: &str) -> bool {
    match plate_name.strip_prefix('T') {
        Some(rest) => !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()),
        None => false,
    }
}

/// 384-well plates (assay or titration) whose name ends with `workflow_id`.
pub fn is_384_well_plate(path: impl AsRef<Path>, workflow_id: &str) -> bool {
    let name = plate_name(path);
    let parsed = match self::workflow_id(&name) {
        Ok(id) => id,
        Err(_) => return false,
    };
    (name.starts_with('S') || name.starts_with('T')) && parsed == workflow_id
}

/// Whether `path` is a replicate of the given workflow: same workflow id,
/// same role character and a plate number from `plate_numbers`.
pub fn is_matching_plate(
    path: impl AsRef<Path>,
    workflow_id: &str,
    role: PlateRole,
    plate_numbers: &[u8],
) -> bool {
    match PlateIdentity::parse(path) {
        Ok(identity) => {
            identity.workflow_id == workflow_id
                && identity.role == role
                && plate_numbers.contains(&identity.plate_number)
        }
        Err(_) => false,
    }
}
