//! Record source adapters: the paginated FMSS collector and photo inventory enumerators.

use std::collections::BTreeSet;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use fpipe_core::{FlattenedRecord, LookupTables, NewPhoto, PageResponse, PhotoKey, Scalar};
use fpipe_storage::{FetchError, HttpFetcher};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "fpipe-adapters";

/// Anything that can hand out pages of raw FMSS items for a site.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_page(&self, key: &str, page: u32) -> Result<PageResponse<JsonValue>, FetchError>;
}

/// `GET <base>?siteid=<key>&page=<n>` against one FMSS endpoint.
#[derive(Debug, Clone)]
pub struct FmssPageSource {
    http: HttpFetcher,
    base_url: String,
}

impl FmssPageSource {
    pub fn new(http: HttpFetcher, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }

}

#[async_trait]
impl PageSource for FmssPageSource {
    async fn fetch_page(&self, key: &str, page: u32) -> Result<PageResponse<JsonValue>, FetchError> {
        self.http
            .fetch_json(
                &self.base_url,
                &[("siteid", key.to_string()), ("page", page.to_string())],
            )
            .await
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct StatusRecord {
    #[serde(rename = "Value", default)]
    pub value: Scalar,
    #[serde(rename = "maxvalue", default)]
    pub max_value: Scalar,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct LocationHierarchy {
    #[serde(rename = "ORGID", default)]
    pub org_id: Scalar,
    #[serde(rename = "PARENT", default)]
    pub parent: Scalar,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct LocationOperation {
    #[serde(rename = "FL03", alias = "FLO3", default)]
    pub optimizer_band: Scalar,
}

/// Nested sub-records shared by locations and assets; each may be absent.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct NestedRecords {
    #[serde(rename = "STATUS", default)]
    pub status: Option<StatusRecord>,
    #[serde(rename = "LOCHIERARCHY", default)]
    pub hierarchy: Option<LocationHierarchy>,
    #[serde(rename = "LOCOPER", default)]
    pub operation: Option<LocationOperation>,
}

impl NestedRecords {
    pub fn status_value(&self) -> Scalar {
        self.status
            .as_ref()
            .map(|s| s.value.clone())
            .unwrap_or_default()
    }

    /// `maxvalue` as sent, else derived from the status table.
    pub fn status_max(&self, tables: &LookupTables) -> Scalar {
        let Some(status) = &self.status else {
            return Scalar::Null;
        };
        if !status.max_value.is_null() {
            return status.max_value.clone();
        }
        status
            .value
            .as_str()
            .and_then(|v| tables.max_status(v))
            .map(Scalar::text)
            .unwrap_or_default()
    }

    pub fn parent_org(&self) -> Scalar {
        self.hierarchy
            .as_ref()
            .map(|h| h.org_id.clone())
            .unwrap_or_default()
    }

    pub fn parent_location(&self) -> Scalar {
        self.hierarchy
            .as_ref()
            .map(|h| h.parent.clone())
            .unwrap_or_default()
    }

    pub fn optimizer_band(&self) -> Scalar {
        self.operation
            .as_ref()
            .map(|o| o.optimizer_band.clone())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LocationItem {
    #[serde(rename = "LO2")]
    pub asset_code: Scalar,
    #[serde(rename = "LOCATION")]
    pub location: Scalar,
    #[serde(rename = "DESCRIPTION")]
    pub description: Scalar,
    #[serde(rename = "LO5")]
    pub api: Scalar,
    #[serde(rename = "LO6")]
    pub crv: Scalar,
    #[serde(rename = "LO7")]
    pub fci: Scalar,
    #[serde(rename = "LO9")]
    pub dm: Scalar,
    #[serde(rename = "LO11")]
    pub unit_of_measure: Scalar,
    #[serde(rename = "ORGID")]
    pub org_id: Scalar,
    #[serde(rename = "LO14")]
    pub unknown: Scalar,
    #[serde(rename = "LOCATIONSID")]
    pub locations_id: Scalar,
    #[serde(flatten)]
    pub nested: NestedRecords,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AssetItem {
    #[serde(rename = "ASSETTYPE")]
    pub asset_type: Scalar,
    #[serde(rename = "EQ4")]
    pub asset_code: Scalar,
    #[serde(rename = "ASSETID")]
    pub asset_id: Scalar,
    #[serde(rename = "ASSETNUM")]
    pub asset_num: Scalar,
    #[serde(rename = "ASSETUID")]
    pub asset_uid: Scalar,
    #[serde(rename = "LOCATION")]
    pub location: Scalar,
    #[serde(rename = "DESCRIPTION")]
    pub description: Scalar,
    #[serde(rename = "EQ19")]
    pub eq19: Scalar,
    #[serde(rename = "EQ20")]
    pub eq20: Scalar,
    #[serde(rename = "EQ21")]
    pub eq21: Scalar,
    #[serde(rename = "EQ5")]
    pub eq5: Scalar,
    #[serde(rename = "EQ6")]
    pub eq6: Scalar,
    #[serde(rename = "EQ7")]
    pub quantity: Scalar,
    #[serde(rename = "EQ8")]
    pub unit_of_measure: Scalar,
    #[serde(rename = "EQ9")]
    pub expiration_date: Scalar,
    #[serde(rename = "INSTALLDATE")]
    pub install_date: Scalar,
    #[serde(rename = "REPLACECOST")]
    pub replacement_cost: Scalar,
    #[serde(rename = "ORGID")]
    pub org_id: Scalar,
    #[serde(flatten)]
    pub nested: NestedRecords,
}

/// A kind of FMSS record: how to decode an item and project it onto a fixed header.
pub trait RecordKind {
    type Item: DeserializeOwned;

    const LABEL: &'static str;
    const HEADER: &'static [&'static str];

    fn flatten(item: &Self::Item, park: &str, tables: &LookupTables) -> FlattenedRecord;

    /// Non-fatal data quality observations about an item.
    fn quality_notes(_item: &Self::Item, _tables: &LookupTables) -> Vec<String> {
        Vec::new()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Locations;

#[derive(Debug, Clone, Copy)]
pub struct Assets;

impl RecordKind for Locations {
    type Item = LocationItem;

    const LABEL: &'static str = "Location";
    const HEADER: &'static [&'static str] = &[
        "Park",
        "Asset_Code",
        "Location",
        "Description",
        "Status",
        "Parent_Location",
        "API",
        "CRV",
        "FCI",
        "DM",
        "Unit_of_Measure",
        "StatusMax",
        "Organization",
        "Parent_Organization",
        "Unknown",
        "Optimizer_Band",
        "LocationsId",
    ];

    fn flatten(item: &LocationItem, park: &str, tables: &LookupTables) -> FlattenedRecord {
        FlattenedRecord::new(vec![
            Scalar::text(park),
            item.asset_code.clone(),
            item.location.clone(),
            item.description.clone(),
            item.nested.status_value(),
            item.nested.parent_location(),
            item.api.clone(),
            item.crv.clone(),
            item.fci.clone(),
            item.dm.clone(),
            item.unit_of_measure.clone(),
            item.nested.status_max(tables),
            item.org_id.clone(),
            item.nested.parent_org(),
            item.unknown.clone(),
            item.nested.optimizer_band(),
            item.locations_id.clone(),
        ])
    }

    fn quality_notes(item: &LocationItem, tables: &LookupTables) -> Vec<String> {
        let mut notes = Vec::new();
        if tables.asset_code_name(&item.asset_code).is_none() {
            notes.push(format!("unrecognized asset code '{}'", item.asset_code));
        }
        if let Some(status) = item.nested.status_value().as_str() {
            if tables.max_status(status).is_none() {
                notes.push(format!("unrecognized status '{status}'"));
            }
        }
        notes
    }
}

impl RecordKind for Assets {
    type Item = AssetItem;

    const LABEL: &'static str = "Asset";
    const HEADER: &'static [&'static str] = &[
        "Park",
        "Asset_Type",
        "Asset_Code",
        "Asset_ID",
        "Asset_UID",
        "Asset_Num",
        "Location",
        "Description",
        "unk19",
        "unk20",
        "unk21",
        "unk5",
        "unk6",
        "Quantity",
        "Unit_of_Measure",
        "Expiration_Date",
        "Install_Date",
        "Replacement_Cost",
        "Organization",
        "Parent_Org",
        "Parent_Loc",
        "Opt",
    ];

    // Values follow the service's ASSETID, ASSETNUM, ASSETUID order under the
    // Asset_ID, Asset_UID, Asset_Num headings the downstream sheets key on.
    fn flatten(item: &AssetItem, park: &str, _tables: &LookupTables) -> FlattenedRecord {
        FlattenedRecord::new(vec![
            Scalar::text(park),
            item.asset_type.clone(),
            item.asset_code.clone(),
            item.asset_id.clone(),
            item.asset_num.clone(),
            item.asset_uid.clone(),
            item.location.clone(),
            item.description.clone(),
            item.eq19.clone(),
            item.eq20.clone(),
            item.eq21.clone(),
            item.eq5.clone(),
            item.eq6.clone(),
            item.quantity.clone(),
            item.unit_of_measure.clone(),
            item.expiration_date.clone(),
            item.install_date.clone(),
            item.replacement_cost.clone(),
            item.org_id.clone(),
            item.nested.parent_org(),
            item.nested.parent_location(),
            item.nested.optimizer_band(),
        ])
    }

    fn quality_notes(item: &AssetItem, tables: &LookupTables) -> Vec<String> {
        if tables.asset_code_name(&item.asset_code).is_none() {
            vec![format!("unrecognized asset code '{}'", item.asset_code)]
        } else {
            Vec::new()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageFailure {
    pub park: String,
    pub key: String,
    pub page: u32,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CollectOutcome {
    pub records: Vec<FlattenedRecord>,
    pub pages_fetched: u32,
    pub skipped_items: usize,
    pub failure: Option<PageFailure>,
}

/// Walks every page of a site query and flattens the items in page order.
pub struct PaginatedCollector<'a, S: ?Sized> {
    source: &'a S,
    tables: &'a LookupTables,
}

impl<'a, S: PageSource + ?Sized> PaginatedCollector<'a, S> {
    pub fn new(source: &'a S, tables: &'a LookupTables) -> Self {
        Self { source, tables }
    }

    /// Resolves the park's site id first; an unknown park yields an empty outcome.
    pub async fn collect<K: RecordKind>(&self, park: &str) -> CollectOutcome {
        match self.tables.site_id(park) {
            Some(site_id) => self.collect_site::<K>(park, site_id).await,
            None => {
                warn!(park, "no FMSS site id for park; skipping");
                CollectOutcome::default()
            }
        }
    }

    pub async fn collect_parks<K: RecordKind>(&self, parks: &[String]) -> Vec<(String, CollectOutcome)> {
        let mut outcomes = Vec::with_capacity(parks.len());
        for park in parks {
            let outcome = self.collect::<K>(park).await;
            outcomes.push((park.clone(), outcome));
        }
        outcomes
    }

    /// A failed page ends pagination for this site; records from earlier pages are kept.
    pub async fn collect_site<K: RecordKind>(&self, park: &str, site_id: &str) -> CollectOutcome {
        let mut outcome = CollectOutcome::default();
        let mut page = 1u32;

        loop {
            let response = match self.source.fetch_page(site_id, page).await {
                Ok(response) => response,
                Err(err) => {
                    warn!(
                        park,
                        site_id,
                        page,
                        error = %err,
                        "Unable to retrieve {} page {} for {}",
                        K::LABEL,
                        page,
                        park
                    );
                    outcome.failure = Some(PageFailure {
                        park: park.to_string(),
                        key: site_id.to_string(),
                        page,
                        message: err.to_string(),
                    });
                    return outcome;
                }
            };

            // A page number behind the requested one would repeat forever.
            if response.current_page < page {
                warn!(
                    park,
                    site_id,
                    page,
                    answered = response.current_page,
                    "{} source answered page {} for page {} of {}; stopping",
                    K::LABEL,
                    response.current_page,
                    page,
                    park
                );
                outcome.failure = Some(PageFailure {
                    park: park.to_string(),
                    key: site_id.to_string(),
                    page,
                    message: format!("requested page {page} but received page {}", response.current_page),
                });
                return outcome;
            }

            outcome.pages_fetched += 1;
            let done = response.is_last();
            info!(
                park,
                page = response.current_page,
                total_pages = response.total_pages,
                items = response.items.len(),
                "{} page fetched",
                K::LABEL
            );

            for (index, raw) in response.items.into_iter().enumerate() {
                match serde_json::from_value::<K::Item>(raw) {
                    Ok(item) => {
                        for note in K::quality_notes(&item, self.tables) {
                            debug!(park, page, index, "{}: {}", K::LABEL, note);
                        }
                        outcome.records.push(K::flatten(&item, park, self.tables));
                    }
                    Err(err) => {
                        warn!(park, page, index, error = %err, "skipping undecodable {} item", K::LABEL);
                        outcome.skipped_items += 1;
                    }
                }
            }

            if done {
                return outcome;
            }
            page += 1;
        }
    }
}

pub fn is_jpeg(name: impl AsRef<Path>) -> bool {
    has_extension(name.as_ref(), &["jpg", "jpeg"])
}

/// JPEGs plus formats that are only ever checked for existence.
pub fn is_image(name: impl AsRef<Path>) -> bool {
    has_extension(name.as_ref(), &["jpg", "jpeg", "png", "gif"])
}

fn has_extension(path: &Path, allowed: &[&str]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| allowed.iter().any(|a| e.eq_ignore_ascii_case(a)))
        .unwrap_or(false)
}

/// Keys for every JPEG directly inside each top-level folder of `root`.
pub fn scan_photo_tree(root: impl AsRef<Path>) -> Result<BTreeSet<PhotoKey>> {
    let root = root.as_ref();
    let mut keys = BTreeSet::new();
    let mut folders = fs::read_dir(root)
        .with_context(|| format!("reading {}", root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .collect::<Vec<_>>();
    folders.sort_by_key(|e| e.file_name());

    for folder in folders {
        let folder_name = folder.file_name().to_string_lossy().to_string();
        let mut count = 0usize;
        for entry in fs::read_dir(folder.path())
            .with_context(|| format!("reading {}", folder.path().display()))?
            .filter_map(|entry| entry.ok())
        {
            if !entry.file_type().map(|ft| ft.is_file()).unwrap_or(false) {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if is_jpeg(&name) {
                keys.insert(PhotoKey::new(format!("{folder_name}/{name}")));
                count += 1;
            }
        }
        debug!(folder = %folder_name, photos = count, "scanned photo folder");
    }
    Ok(keys)
}

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("reading manifest {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("manifest line {line} has {found} columns; expected {expected}")]
    ColumnCount {
        line: usize,
        found: usize,
        expected: usize,
    },
}

pub fn read_manifest(path: impl AsRef<Path>) -> Result<Vec<NewPhoto>, ManifestError> {
    let path = path.as_ref();
    let file = fs::File::open(path).map_err(|e| ManifestError::Read {
        path: path.to_path_buf(),
        source: csv::Error::from(e),
    })?;
    read_manifest_from(file, path)
}

/// Header row skipped; every data row must carry exactly [`NewPhoto::COLUMNS`] cells.
pub fn read_manifest_from<R: Read>(reader: R, path: &Path) -> Result<Vec<NewPhoto>, ManifestError> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(reader);

    let mut photos = Vec::new();
    for (index, record) in csv_reader.records().enumerate() {
        let record = record.map_err(|source| ManifestError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let line = record
            .position()
            .map(|p| p.line() as usize)
            .unwrap_or(index + 2);
        if record.len() != NewPhoto::COLUMNS {
            return Err(ManifestError::ColumnCount {
                line,
                found: record.len(),
                expected: NewPhoto::COLUMNS,
            });
        }
        photos.push(NewPhoto::from_cells(line, record.iter()));
    }
    Ok(photos)
}

pub fn manifest_keys(photos: &[NewPhoto]) -> BTreeSet<PhotoKey> {
    photos.iter().filter_map(NewPhoto::key).collect()
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct MissingPhoto {
    pub path: PathBuf,
    pub line: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestPathReport {
    pub bad_records: Vec<usize>,
    pub missing: Vec<MissingPhoto>,
}

impl ManifestPathReport {
    pub fn is_clean(&self) -> bool {
        self.bad_records.is_empty() && self.missing.is_empty()
    }

    pub fn render(&self) -> String {
        let mut lines = Vec::new();
        for line in &self.bad_records {
            lines.push(format!("Bad record at line {line}"));
        }
        for missing in &self.missing {
            lines.push(format!(
                "Path not found at line {} {}",
                missing.line,
                missing.path.display()
            ));
        }
        if lines.is_empty() {
            lines.push("All manifest photos found.".to_string());
        }
        lines.join("\n")
    }
}

/// Flags manifest rows without a unit or an image filename, and rows whose photo is not on disk.
pub fn check_manifest_paths(photos: &[NewPhoto], original_root: impl AsRef<Path>) -> ManifestPathReport {
    let root = original_root.as_ref();
    let mut report = ManifestPathReport::default();
    for photo in photos {
        let is_photo = photo.filename.as_deref().map(|name| is_image(name)).unwrap_or(false);
        let Some(relative) = photo.relative_path().filter(|_| is_photo) else {
            report.bad_records.push(photo.line);
            continue;
        };
        let path = root.join(relative);
        if !path.exists() {
            report.missing.push(MissingPhoto {
                path,
                line: photo.line,
            });
        }
    }
    report.missing.sort();
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use fpipe_storage::FetchError;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use tempfile::tempdir;

    /// Serves canned pages per site and records every request.
    #[derive(Default)]
    struct ScriptedSource {
        pages: BTreeMap<(String, u32), PageResponse<JsonValue>>,
        requests: Mutex<Vec<(String, u32)>>,
    }

    impl ScriptedSource {
        fn with_page(mut self, key: &str, page: u32, total_pages: u32, items: Vec<JsonValue>) -> Self {
            self.pages.insert(
                (key.to_string(), page),
                PageResponse {
                    total_pages,
                    current_page: page,
                    items,
                    total_items: None,
                    page_size: Some(25),
                },
            );
            self
        }

        fn requests(&self) -> Vec<(String, u32)> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PageSource for ScriptedSource {
        async fn fetch_page(&self, key: &str, page: u32) -> Result<PageResponse<JsonValue>, FetchError> {
            self.requests.lock().unwrap().push((key.to_string(), page));
            self.pages
                .get(&(key.to_string(), page))
                .cloned()
                .ok_or_else(|| FetchError::HttpStatus {
                    status: 500,
                    url: format!("http://fmss.test/api/locations?siteid={key}&page={page}"),
                })
        }
    }

    /// Ignores the requested page and always answers with page 1 of 3.
    #[derive(Default)]
    struct StuckSource {
        requests: Mutex<Vec<u32>>,
    }

    #[async_trait]
    impl PageSource for StuckSource {
        async fn fetch_page(&self, _key: &str, page: u32) -> Result<PageResponse<JsonValue>, FetchError> {
            self.requests.lock().unwrap().push(page);
            Ok(PageResponse {
                total_pages: 3,
                current_page: 1,
                items: vec![location(1, "A")],
                total_items: None,
                page_size: Some(25),
            })
        }
    }

    fn location(id: u64, location: &str) -> JsonValue {
        json!({
            "LOCATIONSID": id,
            "STATUS": {"maxvalue": "OPERATING", "Value": "OPERATING"},
            "DESCRIPTION": format!("Location {location}"),
            "LO11": "AC",
            "LO6": 37978.81,
            "LO2": "3100",
            "LOCHIERARCHY": {"ORGID": "NPS", "PARENT": "ANIA"},
            "SITEID": "P117",
            "LOCATION": location,
            "LO5": 58,
            "ORGID": "NPS",
            "LO14": "",
            "LO9": 3123.6,
            "LOCOPER": {"FL03": "4"},
            "LO7": 0.082
        })
    }

    fn location_column(record: &FlattenedRecord, name: &str) -> Scalar {
        let index = Locations::HEADER.iter().position(|h| *h == name).unwrap();
        record.get(index).cloned().unwrap()
    }

    #[tokio::test]
    async fn collects_every_page_in_order() {
        let source = ScriptedSource::default()
            .with_page("P117", 1, 3, vec![location(1, "A"), location(2, "B")])
            .with_page("P117", 2, 3, vec![location(3, "C")])
            .with_page("P117", 3, 3, vec![location(4, "D"), location(5, "E")]);
        let tables = LookupTables::default();
        let collector = PaginatedCollector::new(&source, &tables);

        let outcome = collector.collect::<Locations>("ANIA").await;

        assert_eq!(outcome.records.len(), 5);
        assert_eq!(outcome.pages_fetched, 3);
        assert!(outcome.failure.is_none());
        let order: Vec<String> = outcome
            .records
            .iter()
            .map(|r| location_column(r, "Location").to_string())
            .collect();
        assert_eq!(order, vec!["A", "B", "C", "D", "E"]);
        assert_eq!(
            source.requests(),
            vec![("P117".to_string(), 1), ("P117".to_string(), 2), ("P117".to_string(), 3)]
        );
    }

    #[tokio::test]
    async fn zero_total_pages_stops_after_one_fetch() {
        let source = ScriptedSource::default().with_page("P119", 1, 0, vec![]);
        let tables = LookupTables::default();
        let collector = PaginatedCollector::new(&source, &tables);

        let outcome = collector.collect::<Assets>("CAKR").await;

        assert!(outcome.records.is_empty());
        assert!(outcome.failure.is_none());
        assert_eq!(source.requests().len(), 1);
    }

    #[tokio::test]
    async fn failed_page_returns_earlier_pages_and_one_failure() {
        let source = ScriptedSource::default()
            .with_page("P117", 1, 4, vec![location(1, "A")])
            .with_page("P117", 2, 4, vec![location(2, "B"), location(3, "C")])
            .with_page("P117", 4, 4, vec![location(9, "Z")]);
        let tables = LookupTables::default();
        let collector = PaginatedCollector::new(&source, &tables);

        let outcome = collector.collect_site::<Locations>("ANIA", "P117").await;

        assert_eq!(outcome.records.len(), 3);
        let failure = outcome.failure.expect("page 3 should fail");
        assert_eq!(failure.key, "P117");
        assert_eq!(failure.park, "ANIA");
        assert_eq!(failure.page, 3);
        assert_eq!(source.requests().len(), 3);
    }

    #[tokio::test]
    async fn unknown_park_is_skipped_without_requests() {
        let source = ScriptedSource::default();
        let tables = LookupTables::default();
        let collector = PaginatedCollector::new(&source, &tables);

        let outcome = collector.collect::<Locations>("XXXX").await;

        assert_eq!(outcome, CollectOutcome::default());
        assert!(source.requests().is_empty());
    }

    #[tokio::test]
    async fn collect_parks_continues_past_a_failed_park() {
        let source = ScriptedSource::default()
            .with_page("P115", 1, 1, vec![location(1, "A")])
            .with_page("P003", 1, 1, vec![location(2, "B")]);
        let tables = LookupTables::default();
        let collector = PaginatedCollector::new(&source, &tables);
        let parks = vec!["AKRO".to_string(), "ANIA".to_string(), "GLBA".to_string()];

        let outcomes = collector.collect_parks::<Locations>(&parks).await;

        assert_eq!(outcomes.len(), 3);
        assert_eq!(outcomes[0].1.records.len(), 1);
        assert!(outcomes[1].1.failure.is_some());
        assert_eq!(outcomes[2].1.records.len(), 1);
    }

    #[tokio::test]
    async fn source_that_never_advances_stops_with_a_failure() {
        let stuck = StuckSource::default();
        let tables = LookupTables::default();
        let collector = PaginatedCollector::new(&stuck, &tables);

        let outcome = collector.collect_site::<Locations>("ANIA", "P117").await;

        assert_eq!(outcome.records.len(), 1);
        assert_eq!(outcome.pages_fetched, 1);
        let failure = outcome.failure.expect("stuck page failure");
        assert_eq!(failure.park, "ANIA");
        assert_eq!(failure.key, "P117");
        assert_eq!(failure.page, 2);
        assert_eq!(*stuck.requests.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn location_flattening_fills_placeholders_for_missing_nested_records() {
        let tables = LookupTables::default();
        let mut raw = location(7, "95774");
        let obj = raw.as_object_mut().unwrap();
        obj.remove("LOCHIERARCHY");
        obj.remove("LOCOPER");
        obj.insert("STATUS".to_string(), json!({"Value": "REMOVED"}));
        let item: LocationItem = serde_json::from_value(raw).unwrap();

        let record = Locations::flatten(&item, "ANIA", &tables);

        assert_eq!(record.len(), Locations::HEADER.len());
        assert_eq!(location_column(&record, "Parent_Location"), Scalar::Null);
        assert_eq!(location_column(&record, "Parent_Organization"), Scalar::Null);
        assert_eq!(location_column(&record, "Optimizer_Band"), Scalar::Null);
        assert_eq!(location_column(&record, "Status"), Scalar::text("REMOVED"));
        assert_eq!(location_column(&record, "StatusMax"), Scalar::text("DECOMMISSIONED"));
    }

    #[test]
    fn location_flattening_without_status_is_total() {
        let tables = LookupTables::default();
        let mut raw = location(8, "1");
        raw.as_object_mut().unwrap().remove("STATUS");
        let item: LocationItem = serde_json::from_value(raw).unwrap();

        let record = Locations::flatten(&item, "ANIA", &tables);

        assert_eq!(record.len(), 17);
        assert_eq!(location_column(&record, "Status"), Scalar::Null);
        assert_eq!(location_column(&record, "StatusMax"), Scalar::Null);
        assert_eq!(location_column(&record, "Optimizer_Band"), Scalar::text("4"));
    }

    #[test]
    fn optimizer_band_accepts_letter_o_spelling() {
        let op: LocationOperation = serde_json::from_value(json!({"FLO3": "KATM001"})).unwrap();
        assert_eq!(op.optimizer_band, Scalar::text("KATM001"));
    }

    #[test]
    fn asset_flattening_keeps_service_value_order() {
        let tables = LookupTables::default();
        let item: AssetItem = serde_json::from_value(json!({
            "ASSETTYPE": "BUILDING", "EQ4": "4100", "ASSETID": 11, "ASSETNUM": "A-22",
            "ASSETUID": 33, "LOCATION": "95774", "DESCRIPTION": "Cabin",
            "EQ19": null, "EQ20": null, "EQ21": null, "EQ5": "", "EQ6": "",
            "EQ7": 1, "EQ8": "EA", "EQ9": null, "INSTALLDATE": "1950-01-01T00:00:00",
            "REPLACECOST": 125000.5, "ORGID": "NPS",
            "LOCHIERARCHY": {"PARENT": "ANIA"}
        }))
        .unwrap();

        let record = Assets::flatten(&item, "ANIA", &tables);

        assert_eq!(record.len(), Assets::HEADER.len());
        assert_eq!(record.get(3), Some(&Scalar::Number(11u64.into())));
        assert_eq!(record.get(4), Some(&Scalar::text("A-22")));
        assert_eq!(record.get(5), Some(&Scalar::Number(33u64.into())));
        assert_eq!(record.get(19), Some(&Scalar::Null));
        assert_eq!(record.get(20), Some(&Scalar::text("ANIA")));
        assert!(Assets::quality_notes(&item, &tables).is_empty());
    }

    #[tokio::test]
    async fn undecodable_items_are_skipped_not_fatal() {
        let mut broken = location(2, "B");
        broken.as_object_mut().unwrap().remove("LOCATION");
        let source = ScriptedSource::default().with_page("P117", 1, 1, vec![location(1, "A"), broken]);
        let tables = LookupTables::default();
        let collector = PaginatedCollector::new(&source, &tables);

        let outcome = collector.collect::<Locations>("ANIA").await;

        assert_eq!(outcome.records.len(), 1);
        assert_eq!(outcome.skipped_items, 1);
        assert!(outcome.failure.is_none());
    }

    #[test]
    fn quality_notes_flag_unknown_codes() {
        let tables = LookupTables::default();
        let mut raw = location(1, "A");
        raw["LO2"] = json!("9999");
        raw["STATUS"] = json!({"Value": "BOGUS", "maxvalue": "OPERATING"});
        let item: LocationItem = serde_json::from_value(raw).unwrap();
        let notes = Locations::quality_notes(&item, &tables);
        assert_eq!(notes.len(), 2);
    }

    #[test]
    fn photo_tree_scan_is_two_level_and_jpeg_only() {
        let dir = tempdir().expect("tempdir");
        let akro = dir.path().join("AKRO");
        std::fs::create_dir_all(akro.join("nested")).unwrap();
        std::fs::write(akro.join("A.JPG"), b"x").unwrap();
        std::fs::write(akro.join("b.jpeg"), b"x").unwrap();
        std::fs::write(akro.join("c.png"), b"x").unwrap();
        std::fs::write(akro.join("nested").join("d.jpg"), b"x").unwrap();
        std::fs::write(dir.path().join("loose.jpg"), b"x").unwrap();

        let keys = scan_photo_tree(dir.path()).expect("scan");

        let keys: Vec<&str> = keys.iter().map(PhotoKey::as_str).collect();
        assert_eq!(keys, vec!["akro/a.jpg", "akro/b.jpeg"]);
        assert!(is_image("c.PNG"));
        assert!(!is_jpeg("c.png"));
    }

    const MANIFEST_HEADER: &str = "UNITCODE,FOLDER,FILENAME,TIMESTAMP,FACLOCID,FACASSETID,FEATUREID,GEOMETRYID,DESCRIPTION,ORIGINALPATH,CREATEUSER,CREATEDATE,NOTES\n";

    #[test]
    fn manifest_rows_are_read_with_line_numbers() {
        let text = format!(
            "{MANIFEST_HEADER}KATM,,a.jpg,2018-06-01,123,,,,Lodge,,,,\nDENA,Kantishna,B.JPG,,,,,{{G1}},,,me,2018-01-01,note\n"
        );
        let photos = read_manifest_from(text.as_bytes(), Path::new("PhotoCSVLoader.csv")).unwrap();

        assert_eq!(photos.len(), 2);
        assert_eq!(photos[0].line, 2);
        assert_eq!(photos[1].line, 3);
        assert_eq!(photos[1].geometry_id.as_deref(), Some("{G1}"));
        let keys: Vec<String> = manifest_keys(&photos).iter().map(|k| k.to_string()).collect();
        assert_eq!(keys, vec!["dena/kantishna/b.jpg", "katm/a.jpg"]);
    }

    #[test]
    fn manifest_with_wrong_column_count_is_rejected() {
        let text = format!("{MANIFEST_HEADER}KATM,,a.jpg\n");
        let err = read_manifest_from(text.as_bytes(), Path::new("m.csv")).unwrap_err();
        assert!(matches!(
            err,
            ManifestError::ColumnCount { line: 2, found: 3, expected: 13 }
        ));
    }

    #[test]
    fn manifest_path_check_reports_bad_and_missing_rows() {
        let dir = tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("KATM")).unwrap();
        std::fs::write(dir.path().join("KATM").join("a.jpg"), b"x").unwrap();
        let photos = vec![
            NewPhoto::from_cells(2, ["KATM", "", "a.jpg"]),
            NewPhoto::from_cells(3, ["KATM", "", "z.jpg"]),
            NewPhoto::from_cells(4, ["", "", "b.jpg"]),
            NewPhoto::from_cells(5, ["KATM", "", "m.jpg"]),
            NewPhoto::from_cells(6, ["KATM", "", "notes.txt"]),
            NewPhoto::from_cells(7, ["KATM", "", "map.png"]),
        ];

        let report = check_manifest_paths(&photos, dir.path());

        assert_eq!(report.bad_records, vec![4, 6]);
        let missing: Vec<usize> = report.missing.iter().map(|m| m.line).collect();
        assert_eq!(missing, vec![5, 7, 3]);
        assert!(report.render().contains("Bad record at line 4"));
        assert!(!report.is_clean());
    }
}
