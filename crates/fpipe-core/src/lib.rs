//! Core domain model for the facility photo pipeline.

use std::collections::BTreeMap;
use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "fpipe-core";

/// A scalar cell value as it arrives from the FMSS service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum Scalar {
    #[default]
    Null,
    Bool(bool),
    Number(serde_json::Number),
    Text(String),
}

impl Scalar {
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Integer view used for code lookups; accepts numeric strings such as `"3100"`.
    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Self::Number(n) => n.as_u64().and_then(|v| u32::try_from(v).ok()),
            Self::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

impl From<Option<String>> for Scalar {
    fn from(value: Option<String>) -> Self {
        value.map(Scalar::Text).unwrap_or_default()
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => Ok(()),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

/// Fixed-width projection of one item, positions matching a record kind header.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlattenedRecord(Vec<Scalar>);

impl FlattenedRecord {
    pub fn new(values: Vec<Scalar>) -> Self {
        Self(values)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Scalar> {
        self.0.get(index)
    }

    pub fn to_strings(&self) -> Vec<String> {
        self.0.iter().map(|v| v.to_string()).collect()
    }
}

/// One page of a paginated FMSS query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageResponse<T> {
    #[serde(rename = "TotalPages")]
    pub total_pages: u32,
    #[serde(rename = "Page")]
    pub current_page: u32,
    #[serde(rename = "PagedList", default)]
    pub items: Vec<T>,
    #[serde(rename = "TotalItems", default)]
    pub total_items: Option<u64>,
    #[serde(rename = "PageSize", default)]
    pub page_size: Option<u32>,
}

impl<T> PageResponse<T> {
    /// `total_pages` is 0 when the site has no data, so page 1 is also the last.
    pub fn is_last(&self) -> bool {
        self.current_page >= self.total_pages
    }
}

/// Case-folded `unit/[folder/]filename` used to match a photo across sources.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct PhotoKey(String);

impl PhotoKey {
    pub fn new(raw: impl AsRef<str>) -> Self {
        Self(raw.as_ref().to_lowercase())
    }

    pub fn from_parts(unit: &str, folder: Option<&str>, filename: &str) -> Self {
        match folder.filter(|f| !f.is_empty()) {
            Some(folder) => Self::new(format!("{unit}/{folder}/{filename}")),
            None => Self::new(format!("{unit}/{filename}")),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PhotoKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl fmt::Display for PhotoKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Immutable code tables shared by the FMSS jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LookupTables {
    /// Park unit code -> FMSS site id used in the query string.
    pub sites: BTreeMap<String, String>,
    /// Status value -> status max value.
    pub statuses: BTreeMap<String, String>,
    /// Asset code -> common name.
    pub asset_codes: BTreeMap<u32, String>,
}

impl LookupTables {
    pub fn site_id(&self, park: &str) -> Option<&str> {
        self.sites.get(park).map(String::as_str)
    }

    pub fn parks(&self) -> impl Iterator<Item = &str> {
        self.sites.keys().map(String::as_str)
    }

    pub fn max_status(&self, status: &str) -> Option<&str> {
        self.statuses.get(status).map(String::as_str)
    }

    pub fn asset_code_name(&self, code: &Scalar) -> Option<&str> {
        code.as_u32()
            .and_then(|c| self.asset_codes.get(&c))
            .map(String::as_str)
    }
}

impl Default for LookupTables {
    fn default() -> Self {
        let sites = [
            ("AKRO", "P115"),
            ("ANCH", "P166"),
            ("FAIR", "P120"),
            ("ALEU", "P165"),
            ("ALAG", "P116"),
            ("ANIA", "P117"),
            ("BELA", "P118"),
            ("CAKR", "P119"),
            ("DENA", "P167"),
            ("GAAR", "P121"),
            ("GLBA", "P003"),
            ("KATM", "P122"),
            ("KEFJ", "P123"),
            ("KLGO", "P168"),
            ("LACL", "P169"),
            ("KOVA", "P124"),
            ("NOAT", "P125"),
            ("SITK", "P126"),
            ("WEAR", "P127"),
            ("WRST", "P128"),
            ("YUCH", "P170"),
        ];
        let statuses = [
            ("EXCESS", "OPERATING"),
            ("INACTIVE", "OPERATING"),
            ("NOTREADY", "NOTREADY"),
            ("OPERATING", "OPERATING"),
            ("PLANNED", "NOTREADY"),
            ("REMOVED", "DECOMMISSIONED"),
            ("SITE", "OPERATING"),
        ];
        let asset_codes = [
            (0, "Site"),
            (1100, "Road"),
            (1300, "Parking Area"),
            (1700, "Road Bridge"),
            (1800, "Road Tunnel"),
            (2100, "Trail"),
            (2200, "Trail Bridge"),
            (2300, "Trail Tunnel"),
            (3100, "Grounds"),
            (3800, "Fence"),
            (4100, "Building"),
            (5100, "Utility-Water"),
            (5200, "Utility-Sewer"),
            (5300, "Utility-Heat"),
            (5400, "Utility-Elec"),
            (5500, "Utility-Comm"),
            (5700, "Utility-Fuel"),
            (5800, "Utility-Waste"),
            (6200, "Constructed Waterway"),
            (6300, "Marina/Waterfront System"),
            (6400, "Aviation System"),
            (7100, "Monument"),
            (7200, "Maintained Archeological Sites"),
            (7400, "Towers/Missile Silos"),
            (7500, "Intepretive Media"),
            (7900, "Amphitheater"),
        ];
        Self {
            sites: sites
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            statuses: statuses
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            asset_codes: asset_codes
                .into_iter()
                .map(|(k, v)| (k, v.to_string()))
                .collect(),
        }
    }
}

pub const DEFAULT_CREATE_USER: &str = "AKRO_GIS";

/// One row of the photo load manifest (`PhotoCSVLoader.csv`).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NewPhoto {
    /// 1-based line in the manifest file (header = 1).
    pub line: usize,
    pub unit_code: Option<String>,
    pub folder: Option<String>,
    pub filename: Option<String>,
    pub timestamp: Option<String>,
    pub fac_loc_id: Option<String>,
    pub fac_asset_id: Option<String>,
    pub feature_id: Option<String>,
    pub geometry_id: Option<String>,
    pub description: Option<String>,
    pub original_path: Option<String>,
    pub create_user: Option<String>,
    pub create_date: Option<String>,
    pub notes: Option<String>,
}

impl NewPhoto {
    pub const COLUMNS: usize = 13;

    /// Builds a row from exactly [`NewPhoto::COLUMNS`] cells; empty cells become `None`.
    pub fn from_cells<'a>(line: usize, cells: impl IntoIterator<Item = &'a str>) -> Self {
        let mut cells = cells.into_iter().map(|c| {
            let c = c.trim();
            (!c.is_empty()).then(|| c.to_string())
        });
        let mut next = || cells.next().flatten();
        Self {
            line,
            unit_code: next(),
            folder: next(),
            filename: next(),
            timestamp: next(),
            fac_loc_id: next(),
            fac_asset_id: next(),
            feature_id: next(),
            geometry_id: next(),
            description: next(),
            original_path: next(),
            create_user: next(),
            create_date: next(),
            notes: next(),
        }
    }

    pub fn key(&self) -> Option<PhotoKey> {
        let unit = self.unit_code.as_deref()?;
        let filename = self.filename.as_deref()?;
        Some(PhotoKey::from_parts(unit, self.folder.as_deref(), filename))
    }

    /// Path of the photo relative to the photo tree root.
    pub fn relative_path(&self) -> Option<String> {
        let unit = self.unit_code.as_deref()?;
        let filename = self.filename.as_deref()?;
        Some(match self.folder.as_deref() {
            Some(folder) => format!("{unit}/{folder}/{filename}"),
            None => format!("{unit}/{filename}"),
        })
    }

    pub fn with_defaults(mut self, today: NaiveDate) -> Self {
        if self.create_user.is_none() {
            self.create_user = Some(DEFAULT_CREATE_USER.to_string());
        }
        if self.create_date.is_none() {
            self.create_date = Some(today.format("%Y-%m-%d").to_string());
        }
        self
    }

    pub fn web_link(&self, web_base_url: &str) -> String {
        let base = web_base_url.trim_end_matches('/');
        let unit = self.unit_code.as_deref().unwrap_or_default();
        let filename = self.filename.as_deref().unwrap_or_default();
        match self.folder.as_deref() {
            Some(folder) => format!("{base}/{unit}/{folder}/{filename}"),
            None => format!("{base}/{unit}/{filename}"),
        }
    }

    pub fn to_attachment_row(&self, web_base_url: &str) -> AttachmentRow {
        AttachmentRow {
            link: self.web_link(web_base_url),
            unit_code: self.unit_code.clone(),
            alt_name: self.filename.clone(),
            date: self.timestamp.clone(),
            fac_loc_id: self.fac_loc_id.clone(),
            fac_asset_id: self.fac_asset_id.clone(),
            feature_id: self.feature_id.clone(),
            geometry_id: self.geometry_id.clone(),
            name: self.description.clone(),
            source: self.original_path.clone(),
            create_user: self.create_user.clone(),
            create_date: self.create_date.clone(),
            notes: self.notes.clone(),
        }
    }
}

/// Column values for one inserted attachment record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttachmentRow {
    pub link: String,
    pub unit_code: Option<String>,
    pub alt_name: Option<String>,
    pub date: Option<String>,
    pub fac_loc_id: Option<String>,
    pub fac_asset_id: Option<String>,
    pub feature_id: Option<String>,
    pub geometry_id: Option<String>,
    pub name: Option<String>,
    pub source: Option<String>,
    pub create_user: Option<String>,
    pub create_date: Option<String>,
    pub notes: Option<String>,
}

/// Photo path linked to a single feature id, as used by the photo lookup export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhotoLink {
    pub feature_id: String,
    pub photo: String,
}

/// Text drawn onto a web photo.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PhotoAnnotation {
    pub unit: Option<String>,
    pub tag: Option<String>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub date: Option<String>,
    pub desc: Option<String>,
}

impl PhotoAnnotation {
    /// Used when the database has no attachment row for the photo.
    pub fn unknown(folder: &str) -> Self {
        Self {
            unit: Some(folder.to_string()),
            tag: Some("unknown".to_string()),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn photo_keys_compare_case_insensitively() {
        assert_eq!(PhotoKey::new("AKRO/A.JPG"), PhotoKey::new("akro/a.jpg"));
        assert_eq!(PhotoKey::new("AKRO/A.JPG").as_str(), "akro/a.jpg");
        assert_ne!(PhotoKey::new("akro\\a.jpg"), PhotoKey::new("akro/a.jpg"));
    }

    #[test]
    fn photo_key_from_parts_skips_empty_folder() {
        assert_eq!(
            PhotoKey::from_parts("KATM", Some(""), "Bldg.JPG").as_str(),
            "katm/bldg.jpg"
        );
        assert_eq!(
            PhotoKey::from_parts("KATM", Some("Brooks"), "Bldg.JPG").as_str(),
            "katm/brooks/bldg.jpg"
        );
    }

    #[test]
    fn scalars_deserialize_from_mixed_json() {
        let values: Vec<Scalar> =
            serde_json::from_str(r#"[null, "AC", 37978.81, 58, true]"#).unwrap();
        assert_eq!(values[0], Scalar::Null);
        assert_eq!(values[1], Scalar::text("AC"));
        assert_eq!(values[2].to_string(), "37978.81");
        assert_eq!(values[3].as_u32(), Some(58));
        assert_eq!(values[4], Scalar::Bool(true));
        assert_eq!(Scalar::Null.to_string(), "");
    }

    #[test]
    fn page_with_zero_total_pages_is_last() {
        let page: PageResponse<serde_json::Value> =
            serde_json::from_str(r#"{"TotalItems":0,"TotalPages":0,"PagedList":[],"Page":1,"PageSize":25}"#)
                .unwrap();
        assert!(page.is_last());
        assert!(page.items.is_empty());
    }

    #[test]
    fn default_tables_cover_alaska_units() {
        let tables = LookupTables::default();
        assert_eq!(tables.sites.len(), 21);
        assert_eq!(tables.site_id("ANIA"), Some("P117"));
        assert_eq!(tables.max_status("REMOVED"), Some("DECOMMISSIONED"));
        assert_eq!(tables.asset_code_name(&Scalar::text("4100")), Some("Building"));
        assert_eq!(tables.asset_code_name(&Scalar::Null), None);
    }

    #[test]
    fn new_photo_defaults_and_links() {
        let cells = [
            "KATM", "", "IMG_01.jpg", "2018-06-01 10:00:00", "12345", "", "", "", "Lodge", "", "",
            "", "",
        ];
        let photo = NewPhoto::from_cells(2, cells)
            .with_defaults(NaiveDate::from_ymd_opt(2018, 12, 11).unwrap());
        assert_eq!(photo.folder, None);
        assert_eq!(photo.create_user.as_deref(), Some(DEFAULT_CREATE_USER));
        assert_eq!(photo.create_date.as_deref(), Some("2018-12-11"));
        assert_eq!(
            photo.web_link("https://akrgis.nps.gov/fmss/photos/web/"),
            "https://akrgis.nps.gov/fmss/photos/web/KATM/IMG_01.jpg"
        );

        let row = photo.to_attachment_row("https://akrgis.nps.gov/fmss/photos/web");
        assert_eq!(row.alt_name.as_deref(), Some("IMG_01.jpg"));
        assert_eq!(row.name.as_deref(), Some("Lodge"));
        assert_eq!(row.fac_asset_id, None);
    }

    #[test]
    fn new_photo_link_includes_folder() {
        let mut photo = NewPhoto {
            unit_code: Some("DENA".into()),
            folder: Some("Kantishna".into()),
            filename: Some("a.jpg".into()),
            ..NewPhoto::default()
        };
        assert_eq!(photo.web_link("https://host/web"), "https://host/web/DENA/Kantishna/a.jpg");
        assert_eq!(photo.key().unwrap().as_str(), "dena/kantishna/a.jpg");
        photo.filename = None;
        assert_eq!(photo.key(), None);
    }
}
