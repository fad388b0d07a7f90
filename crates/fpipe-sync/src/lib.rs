//! Batch jobs of the facility photo pipeline: facility export, photo reconciliation,
//! photo loading, the photo lookup export and web photo generation.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ab_glyph::{FontArc, PxScale};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use fpipe_adapters::{
    check_manifest_paths, is_jpeg, manifest_keys, read_manifest, scan_photo_tree, ManifestPathReport,
    PageFailure, PageSource, PaginatedCollector, RecordKind,
};
use fpipe_core::{AttachmentRow, FlattenedRecord, LookupTables, NewPhoto, PhotoAnnotation, PhotoKey, PhotoLink};
use fpipe_storage::{ExportStore, ExportedFile, HttpClientConfig};
use image::imageops::FilterType;
use image::{DynamicImage, ImageDecoder, ImageFormat, ImageReader, Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use serde::Serialize;
use sqlx::{Connection, PgConnection, Row};
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};
use walkdir::WalkDir;

pub const CRATE_NAME: &str = "fpipe-sync";

/// Attachment links served from the public photo site.
pub const PUBLISHED_PHOTO_PATTERN: &str = "http%://akrgis.nps.gov/fmss/photos/%";
pub const PHOTO_VERSION_DESCRIPTION: &str = "For auto upload of new photos";

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub locations_url: String,
    pub assets_url: String,
    pub database_url: String,
    pub photos_root: PathBuf,
    pub manifest_path: PathBuf,
    pub web_base_url: String,
    pub web_photo_font: PathBuf,
    pub lookup_tables_path: Option<PathBuf>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            locations_url: var("FMSS_LOCATIONS_URL")
                .unwrap_or_else(|| "http://inpniscvnpunit2/fmss/api/locations".to_string()),
            assets_url: var("FMSS_ASSETS_URL")
                .unwrap_or_else(|| "http://inpniscvnpunit2/fmss/api/assets".to_string()),
            database_url: var("DATABASE_URL")
                .unwrap_or_else(|| "postgres://localhost:5432/akr_facility2".to_string()),
            photos_root: var("PHOTOS_ROOT").map(PathBuf::from).unwrap_or_else(|| PathBuf::from(".")),
            manifest_path: var("PHOTO_MANIFEST")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("PhotoCSVLoader.csv")),
            web_base_url: var("PHOTO_WEB_BASE_URL")
                .unwrap_or_else(|| "https://akrgis.nps.gov/fmss/photos/web".to_string()),
            web_photo_font: var("WEB_PHOTO_FONT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("ARLRDBD.TTF")),
            lookup_tables_path: var("FPIPE_LOOKUP_TABLES").filter(|v| !v.is_empty()).map(PathBuf::from),
            user_agent: var("FPIPE_USER_AGENT").unwrap_or_else(|| "fpipe/0.1".to_string()),
            http_timeout_secs: var("FPIPE_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
        }
    }

    pub fn original_dir(&self) -> PathBuf {
        self.photos_root.join("ORIGINAL")
    }

    pub fn web_dir(&self) -> PathBuf {
        self.photos_root.join("WEB")
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
        }
    }

    /// Built-in tables unless a YAML override file is configured.
    pub fn lookup_tables(&self) -> Result<LookupTables> {
        match &self.lookup_tables_path {
            Some(path) => load_lookup_tables(path),
            None => Ok(LookupTables::default()),
        }
    }
}

/// Tables missing from the file keep their built-in values.
pub fn load_lookup_tables(path: impl AsRef<Path>) -> Result<LookupTables> {
    let path = path.as_ref();
    let raw = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

// ---------------------------------------------------------------------------
// Facility export

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportTarget {
    Csv(PathBuf),
    Stdout,
}

#[derive(Debug, Clone)]
pub struct FacilityExportSummary {
    pub label: &'static str,
    pub parks: usize,
    pub records: usize,
    pub skipped_items: usize,
    pub failures: Vec<PageFailure>,
    pub written: Option<ExportedFile>,
    /// Rendered rows when exporting to stdout.
    pub plain_text: Option<String>,
}

/// Requested park codes, upper-cased; every park in the site table when none are given.
pub fn resolve_parks(tables: &LookupTables, requested: &[String]) -> Vec<String> {
    if requested.is_empty() {
        tables.parks().map(str::to_string).collect()
    } else {
        requested.iter().map(|p| p.trim().to_uppercase()).collect()
    }
}

pub fn render_plain_rows(header: &[&str], records: &[FlattenedRecord]) -> String {
    let mut out = header.join(",");
    out.push('\n');
    for record in records {
        out.push_str(&record.to_strings().join(","));
        out.push('\n');
    }
    out
}

pub async fn export_facilities<K: RecordKind, S: PageSource + ?Sized>(
    source: &S,
    tables: &LookupTables,
    parks: &[String],
    target: &ExportTarget,
    exports: &ExportStore,
) -> Result<FacilityExportSummary> {
    let span = info_span!("facility_export", kind = K::LABEL, parks = parks.len());
    async {
        let collector = PaginatedCollector::new(source, tables);
        let mut records = Vec::new();
        let mut skipped_items = 0;
        let mut failures = Vec::new();

        for (park, outcome) in collector.collect_parks::<K>(parks).await {
            info!(
                park = %park,
                records = outcome.records.len(),
                pages = outcome.pages_fetched,
                "{} collected",
                K::LABEL
            );
            skipped_items += outcome.skipped_items;
            failures.extend(outcome.failure);
            records.extend(outcome.records);
        }

        let mut summary = FacilityExportSummary {
            label: K::LABEL,
            parks: parks.len(),
            records: records.len(),
            skipped_items,
            failures,
            written: None,
            plain_text: None,
        };

        match target {
            ExportTarget::Csv(path) => {
                let rows = records.iter().map(FlattenedRecord::to_strings);
                let written = exports
                    .write_csv(path, K::HEADER, rows)
                    .await
                    .with_context(|| format!("writing {} export {}", K::LABEL, path.display()))?;
                info!(path = %written.path.display(), bytes = written.byte_size, "{} export written", K::LABEL);
                summary.written = Some(written);
            }
            ExportTarget::Stdout => {
                summary.plain_text = Some(render_plain_rows(K::HEADER, &records));
            }
        }
        Ok::<_, anyhow::Error>(summary)
    }
    .instrument(span)
    .await
}

// ---------------------------------------------------------------------------
// Three-way photo reconciliation

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconciliationReport {
    pub filesystem_count: usize,
    pub database_count: usize,
    pub manifest_count: usize,
    /// On disk but unknown to both the database and the pending manifest.
    pub in_filesystem_only: Vec<PhotoKey>,
    /// Referenced by the database but missing on disk.
    pub in_database_only: Vec<PhotoKey>,
    /// Referenced by the pending manifest but missing on disk.
    pub in_manifest_only: Vec<PhotoKey>,
}

impl ReconciliationReport {
    pub fn is_clean(&self) -> bool {
        self.in_filesystem_only.is_empty() && self.in_database_only.is_empty() && self.in_manifest_only.is_empty()
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("Found {} unique photos in the database.\n", self.database_count));
        out.push_str(&format!("Found {} unique photos in the manifest.\n", self.manifest_count));
        out.push_str(&format!("Found {} unique photos in the filesystem.\n", self.filesystem_count));

        if self.is_clean() {
            out.push_str("No issues found.\n");
            return out;
        }

        let sections = [
            ("the filesystem but not the database or manifest", &self.in_filesystem_only),
            ("the database but not the filesystem", &self.in_database_only),
            ("the manifest but not the filesystem", &self.in_manifest_only),
        ];
        for (title, keys) in sections {
            if keys.is_empty() {
                continue;
            }
            out.push_str(&format!("ERROR: {} photos are in {}\n", keys.len(), title));
            for key in keys.iter() {
                out.push_str(&format!("  {key}\n"));
            }
        }
        out
    }
}

/// Each difference reads only the input sets, never another difference.
pub fn reconcile(
    filesystem: &BTreeSet<PhotoKey>,
    database: &BTreeSet<PhotoKey>,
    manifest: &BTreeSet<PhotoKey>,
) -> ReconciliationReport {
    let in_filesystem_only = filesystem
        .iter()
        .filter(|key| !database.contains(*key) && !manifest.contains(*key))
        .cloned()
        .collect();
    let in_database_only = database.difference(filesystem).cloned().collect();
    let in_manifest_only = manifest.difference(filesystem).cloned().collect();

    ReconciliationReport {
        filesystem_count: filesystem.len(),
        database_count: database.len(),
        manifest_count: manifest.len(),
        in_filesystem_only,
        in_database_only,
        in_manifest_only,
    }
}

pub async fn run_reconciliation<A: AttachmentStore + ?Sized>(
    store: &mut A,
    manifest_path: &Path,
    original_dir: &Path,
) -> Result<ReconciliationReport> {
    let database = store.photo_keys().await.context("reading photo keys from the database")?;
    info!(photos = database.len(), "database photos read");

    let photos = read_manifest(manifest_path)?;
    let manifest = manifest_keys(&photos);
    info!(photos = manifest.len(), path = %manifest_path.display(), "manifest photos read");

    let filesystem = scan_photo_tree(original_dir)?;
    info!(photos = filesystem.len(), root = %original_dir.display(), "filesystem photos scanned");

    Ok(reconcile(&filesystem, &database, &manifest))
}

pub fn check_manifest(manifest_path: &Path, original_dir: &Path) -> Result<ManifestPathReport> {
    let photos = read_manifest(manifest_path)?;
    let report = check_manifest_paths(&photos, original_dir);
    info!(
        rows = photos.len(),
        bad_records = report.bad_records.len(),
        missing = report.missing.len(),
        "manifest paths checked"
    );
    Ok(report)
}

// ---------------------------------------------------------------------------
// Photo database

#[derive(Debug, Error)]
pub enum PhotoDbError {
    #[error(
        "unable to connect to the photo database at {target}: {source}. \
         Make sure the server is reachable, DATABASE_URL is correct and your \
         account has the proper database permissions."
    )]
    Connection {
        target: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("database query failed: {statement}: {source}")]
    Query {
        statement: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("database error:\n{statement}\n{source}")]
    RecordWrite {
        statement: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("no geodatabase version found with a name starting with {0}")]
    VersionNotFound(String),
}

/// Read access to the attachment records.
#[async_trait]
pub trait AttachmentStore: Send {
    /// Folded, de-duplicated `unit/alt name` of every published photo attachment.
    async fn photo_keys(&mut self) -> Result<BTreeSet<PhotoKey>, PhotoDbError>;

    /// Feature id and web-relative photo path, ordered by id then newest attachment first.
    async fn photo_links(&mut self) -> Result<Vec<PhotoLink>, PhotoDbError>;

    async fn photo_annotation(&mut self, folder: &str, photo: &str) -> Result<Option<PhotoAnnotation>, PhotoDbError>;
}

/// Writes inside a versioned edit session.
#[async_trait]
pub trait VersionedEditor: Send {
    /// Returns the qualified `owner.name` of the created version.
    async fn create_version(&mut self, name: &str, description: &str) -> Result<String, PhotoDbError>;
    async fn begin_edit(&mut self, version: &str) -> Result<(), PhotoDbError>;
    async fn insert_photo(&mut self, row: &AttachmentRow) -> Result<(), PhotoDbError>;
    async fn recalculate(&mut self, version: &str) -> Result<(), PhotoDbError>;
    async fn end_edit(&mut self, version: &str) -> Result<(), PhotoDbError>;
}

const PHOTO_KEYS_SQL: &str = r#"
SELECT DISTINCT unitcode || '/' || atchaltname AS name
  FROM gis.akr_attach_evw
 WHERE atchtype = 'Photo'
   AND atchlink LIKE $1
"#;

const PHOTO_LINKS_SQL: &str = r#"
SELECT COALESCE(faclocid, featureid, facassetid, geometryid) AS id,
       REPLACE(atchlink, $1, '') AS photo
  FROM gis.akr_attach_evw
 WHERE atchaltname IS NOT NULL
   AND (faclocid IS NOT NULL OR facassetid IS NOT NULL OR featureid IS NOT NULL OR geometryid IS NOT NULL)
 ORDER BY id, atchdate DESC
"#;

const PHOTO_ANNOTATION_SQL: &str = r#"
SELECT fc.unitcode AS unit,
       COALESCE(a.location || '/' || a.asset, f.location, 'No FMSS ID') AS tag,
       fc.lat,
       fc.lon,
       LEFT(CAST(p.atchdate AS text), 19) AS date,
       COALESCE(fc.maplabel, fc.name, a.description, f.description, 'no name') AS "desc"
  FROM gis.akr_attach_evw AS p
  LEFT JOIN (
        SELECT unitcode, faclocid, facassetid, featureid, geometryid, maplabel, bldgname AS name,
               ST_Y(shape) AS lat, ST_X(shape) AS lon
          FROM gis.akr_bldg_center_pt_evw
        UNION ALL
        SELECT unitcode, faclocid, facassetid, featureid, geometryid, maplabel,
               CASE WHEN trlfeattype = 'Other' THEN trlfeattypeother ELSE trlfeattype END
               || CASE WHEN trlfeatsubtype IS NULL THEN '' ELSE ', ' || trlfeatsubtype END AS name,
               ST_Y(shape) AS lat, ST_X(shape) AS lon
          FROM gis.trails_feature_pt_evw
        UNION ALL
        SELECT unitcode, faclocid, facassetid, featureid, geometryid, maplabel, trlname AS name,
               ST_Y(ST_StartPoint(shape)) AS lat, ST_X(ST_StartPoint(shape)) AS lon
          FROM gis.trails_ln_evw
        UNION ALL
        SELECT unitcode, faclocid, facassetid, featureid, geometryid, maplabel, rdname AS name,
               ST_Y(ST_StartPoint(shape)) AS lat, ST_X(ST_StartPoint(shape)) AS lon
          FROM gis.roads_ln_evw
        UNION ALL
        SELECT unitcode, faclocid, facassetid, featureid, geometryid, maplabel, lotname AS name,
               ST_Y(ST_Centroid(shape)) AS lat, ST_X(ST_Centroid(shape)) AS lon
          FROM gis.parklots_py_evw
        UNION ALL
        SELECT unitcode, faclocid, facassetid, featureid, geometryid, maplabel, assetname AS name,
               ST_Y(shape) AS lat, ST_X(shape) AS lon
          FROM gis.akr_asset_pt_evw
       ) AS fc
    ON fc.faclocid = p.faclocid
    OR fc.facassetid = p.facassetid
    OR fc.featureid = p.featureid
    OR fc.geometryid = p.geometryid
  LEFT JOIN dbo.fmssexport AS f ON f.location = fc.faclocid
  LEFT JOIN dbo.fmssexport_asset AS a ON a.asset = fc.facassetid
 WHERE p.atchlink LIKE $1
 LIMIT 1
"#;

// name rule 1 lets the geodatabase uniquify the name; access 2 is protected.
const CREATE_VERSION_SQL: &str = "SELECT sde.sde_create_version('sde.DEFAULT', $1, 1, 2, $2)";
const FIND_VERSION_SQL: &str =
    "SELECT owner, name FROM sde.sde_versions WHERE name LIKE $1 ORDER BY creation_time DESC LIMIT 1";
const SET_CURRENT_VERSION_SQL: &str = "SELECT sde.sde_set_current_version($1)";
const START_EDIT_SQL: &str = "SELECT sde.sde_edit_version($1, 1)";
const STOP_EDIT_SQL: &str = "SELECT sde.sde_edit_version($1, 2)";
const RECALCULATE_SQL: &str = "SELECT dbo.calc_attachments($1)";
const INSERT_ATTACHMENT_SQL: &str = r#"
INSERT INTO gis.akr_attach_evw
       (atchlink, unitcode, atchaltname, atchdate, faclocid, facassetid, featureid, geometryid,
        atchname, atchsource, createuser, createdate, notes)
VALUES ($1, $2, $3, CAST($4 AS timestamp), $5, $6, $7, $8, $9, $10, $11, CAST($12 AS date), $13)
"#;

/// Collapses whitespace and appends the bound values so a failed statement can be rerun by hand.
fn describe_statement(sql: &str, params: &[Option<&str>]) -> String {
    let sql = sql.split_whitespace().collect::<Vec<_>>().join(" ");
    if params.is_empty() {
        return sql;
    }
    let values = params
        .iter()
        .map(|p| match p {
            Some(v) => format!("'{v}'"),
            None => "NULL".to_string(),
        })
        .collect::<Vec<_>>()
        .join(", ");
    format!("{sql} -- [{values}]")
}

fn attachment_params(row: &AttachmentRow) -> [Option<&str>; 13] {
    [
        Some(row.link.as_str()),
        row.unit_code.as_deref(),
        row.alt_name.as_deref(),
        row.date.as_deref(),
        row.fac_loc_id.as_deref(),
        row.fac_asset_id.as_deref(),
        row.feature_id.as_deref(),
        row.geometry_id.as_deref(),
        row.name.as_deref(),
        row.source.as_deref(),
        row.create_user.as_deref(),
        row.create_date.as_deref(),
        row.notes.as_deref(),
    ]
}

/// Hides the password in a connection URL.
pub fn redact_database_url(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    match rest.rsplit_once('@') {
        Some((credentials, host)) => {
            let user = credentials.split(':').next().unwrap_or_default();
            if credentials.contains(':') {
                format!("{scheme}://{user}:***@{host}")
            } else {
                format!("{scheme}://{user}@{host}")
            }
        }
        None => url.to_string(),
    }
}

/// Attachment store and versioned editor over a single Postgres geodatabase connection.
pub struct PgAttachmentStore {
    conn: PgConnection,
    web_prefix: String,
}

impl PgAttachmentStore {
    pub async fn connect(database_url: &str, web_base_url: &str) -> Result<Self, PhotoDbError> {
        let target = redact_database_url(database_url);
        let conn = PgConnection::connect(database_url)
            .await
            .map_err(|source| PhotoDbError::Connection { target: target.clone(), source })?;
        info!(database = %target, "connected to photo database");
        Ok(Self {
            conn,
            web_prefix: format!("{}/", web_base_url.trim_end_matches('/')),
        })
    }

    async fn execute_edit(&mut self, sql: &str, version: &str) -> Result<(), PhotoDbError> {
        sqlx::query(sql)
            .bind(version)
            .execute(&mut self.conn)
            .await
            .map_err(|source| PhotoDbError::RecordWrite {
                statement: describe_statement(sql, &[Some(version)]),
                source,
            })?;
        debug!(statement = sql, version, "edit statement executed");
        Ok(())
    }
}

fn query_error(sql: &str) -> impl FnOnce(sqlx::Error) -> PhotoDbError + '_ {
    move |source| PhotoDbError::Query {
        statement: describe_statement(sql, &[]),
        source,
    }
}

#[async_trait]
impl AttachmentStore for PgAttachmentStore {
    async fn photo_keys(&mut self) -> Result<BTreeSet<PhotoKey>, PhotoDbError> {
        let rows = sqlx::query(PHOTO_KEYS_SQL)
            .bind(PUBLISHED_PHOTO_PATTERN)
            .fetch_all(&mut self.conn)
            .await
            .map_err(query_error(PHOTO_KEYS_SQL))?;

        let mut keys = BTreeSet::new();
        for row in rows {
            let name: Option<String> = row.try_get("name").map_err(query_error(PHOTO_KEYS_SQL))?;
            if let Some(name) = name {
                keys.insert(PhotoKey::new(name));
            }
        }
        Ok(keys)
    }

    async fn photo_links(&mut self) -> Result<Vec<PhotoLink>, PhotoDbError> {
        let rows = sqlx::query(PHOTO_LINKS_SQL)
            .bind(self.web_prefix.as_str())
            .fetch_all(&mut self.conn)
            .await
            .map_err(query_error(PHOTO_LINKS_SQL))?;

        let mut links = Vec::with_capacity(rows.len());
        for row in rows {
            let id: Option<String> = row.try_get("id").map_err(query_error(PHOTO_LINKS_SQL))?;
            let photo: Option<String> = row.try_get("photo").map_err(query_error(PHOTO_LINKS_SQL))?;
            if let (Some(feature_id), Some(photo)) = (id, photo) {
                links.push(PhotoLink { feature_id, photo });
            }
        }
        Ok(links)
    }

    async fn photo_annotation(&mut self, folder: &str, photo: &str) -> Result<Option<PhotoAnnotation>, PhotoDbError> {
        let pattern = format!("%/web/{}/{}", folder.replace('\\', "/"), photo);
        let row = sqlx::query(PHOTO_ANNOTATION_SQL)
            .bind(pattern.as_str())
            .fetch_optional(&mut self.conn)
            .await
            .map_err(query_error(PHOTO_ANNOTATION_SQL))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let annotation = PhotoAnnotation {
            unit: row.try_get("unit").map_err(query_error(PHOTO_ANNOTATION_SQL))?,
            tag: row.try_get("tag").map_err(query_error(PHOTO_ANNOTATION_SQL))?,
            lat: row.try_get("lat").map_err(query_error(PHOTO_ANNOTATION_SQL))?,
            lon: row.try_get("lon").map_err(query_error(PHOTO_ANNOTATION_SQL))?,
            date: row.try_get("date").map_err(query_error(PHOTO_ANNOTATION_SQL))?,
            desc: row.try_get("desc").map_err(query_error(PHOTO_ANNOTATION_SQL))?,
        };
        Ok(Some(annotation))
    }
}

#[async_trait]
impl VersionedEditor for PgAttachmentStore {
    async fn create_version(&mut self, name: &str, description: &str) -> Result<String, PhotoDbError> {
        // The geodatabase reports errors here even when the version was created.
        if let Err(err) = sqlx::query(CREATE_VERSION_SQL)
            .bind(name)
            .bind(description)
            .execute(&mut self.conn)
            .await
        {
            warn!(version = name, error = %err, "create version reported an error; looking it up anyway");
        }

        let pattern = format!("{name}%");
        let row = sqlx::query(FIND_VERSION_SQL)
            .bind(pattern.as_str())
            .fetch_optional(&mut self.conn)
            .await
            .map_err(query_error(FIND_VERSION_SQL))?
            .ok_or_else(|| PhotoDbError::VersionNotFound(name.to_string()))?;

        let owner: String = row.try_get("owner").map_err(query_error(FIND_VERSION_SQL))?;
        let version: String = row.try_get("name").map_err(query_error(FIND_VERSION_SQL))?;
        Ok(format!("{owner}.{version}"))
    }

    async fn begin_edit(&mut self, version: &str) -> Result<(), PhotoDbError> {
        self.execute_edit(SET_CURRENT_VERSION_SQL, version).await?;
        self.execute_edit(START_EDIT_SQL, version).await
    }

    async fn insert_photo(&mut self, row: &AttachmentRow) -> Result<(), PhotoDbError> {
        let params = attachment_params(row);
        let mut query = sqlx::query(INSERT_ATTACHMENT_SQL);
        for value in params {
            query = query.bind(value);
        }
        query
            .execute(&mut self.conn)
            .await
            .map_err(|source| PhotoDbError::RecordWrite {
                statement: describe_statement(INSERT_ATTACHMENT_SQL, &params),
                source,
            })?;
        Ok(())
    }

    async fn recalculate(&mut self, version: &str) -> Result<(), PhotoDbError> {
        self.execute_edit(RECALCULATE_SQL, version).await
    }

    async fn end_edit(&mut self, version: &str) -> Result<(), PhotoDbError> {
        self.execute_edit(STOP_EDIT_SQL, version).await
    }
}

// ---------------------------------------------------------------------------
// Photo load

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    NothingToLoad,
    Loaded { version: String, inserted: usize },
}

pub fn photo_version_name(today: NaiveDate) -> String {
    format!("photo_update_{}", today.format("%Y%m%d"))
}

/// Inserts every manifest row inside one edit session; the first failure abandons the session.
pub async fn load_new_photos<E: VersionedEditor + ?Sized>(
    editor: &mut E,
    photos: &[NewPhoto],
    web_base_url: &str,
    today: NaiveDate,
) -> Result<LoadOutcome, PhotoDbError> {
    if photos.is_empty() {
        info!("there are no photos to add");
        return Ok(LoadOutcome::NothingToLoad);
    }

    let version = editor
        .create_version(&photo_version_name(today), PHOTO_VERSION_DESCRIPTION)
        .await?;
    info!(version = %version, photos = photos.len(), "loading photos");

    editor.begin_edit(&version).await?;
    for photo in photos {
        let row = photo.clone().with_defaults(today).to_attachment_row(web_base_url);
        debug!(line = photo.line, link = %row.link, "inserting photo");
        editor.insert_photo(&row).await?;
    }
    editor.recalculate(&version).await?;
    editor.end_edit(&version).await?;

    Ok(LoadOutcome::Loaded {
        version,
        inserted: photos.len(),
    })
}

// ---------------------------------------------------------------------------
// Photo lookup export

/// Groups photo paths by feature id, keeping row order within each id.
pub fn build_photo_lookup(rows: impl IntoIterator<Item = PhotoLink>) -> BTreeMap<String, Vec<String>> {
    let mut lookup: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for row in rows {
        lookup.entry(row.feature_id).or_default().push(row.photo);
    }
    lookup
}

#[derive(Debug, Clone)]
pub struct PhotoLookupExport {
    pub features: usize,
    pub photos: usize,
    pub file: ExportedFile,
}

pub async fn export_photo_lookup<A: AttachmentStore + ?Sized>(
    store: &mut A,
    exports: &ExportStore,
    path: &Path,
) -> Result<PhotoLookupExport> {
    let links = store.photo_links().await.context("reading photo links")?;
    let photos = links.len();
    let lookup = build_photo_lookup(links);
    let file = exports
        .write_pretty_json(path, &lookup)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    info!(features = lookup.len(), photos, path = %file.path.display(), "photo lookup written");
    Ok(PhotoLookupExport {
        features: lookup.len(),
        photos,
        file,
    })
}

// ---------------------------------------------------------------------------
// Web photos

pub const UNKNOWN_TAG_LABEL: &str = "Unknown FMSS ID";
pub const UNKNOWN_LOCATION_LABEL: &str = "Location unknown";
pub const UNKNOWN_DATE_LABEL: &str = "No Date/Time";

#[derive(Debug, Clone)]
pub struct WebPhotoStyle {
    pub max_width: u32,
    pub max_height: u32,
    pub margin: i32,
    pub font_size: f32,
    pub font: FontArc,
}

impl WebPhotoStyle {
    pub fn new(font: FontArc) -> Self {
        Self {
            max_width: 1024,
            max_height: 768,
            margin: 8,
            font_size: 18.0,
            font,
        }
    }

    pub fn load(font_path: impl AsRef<Path>) -> Result<Self> {
        let font_path = font_path.as_ref();
        let bytes = fs::read(font_path).with_context(|| format!("reading font {}", font_path.display()))?;
        let font = FontArc::try_from_vec(bytes)
            .map_err(|err| anyhow!("loading font {}: {err}", font_path.display()))?;
        Ok(Self::new(font))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelCorner {
    UpperLeft,
    UpperRight,
    LowerLeft,
    LowerRight,
}

/// Text origin plus the inclusive corners of the black box drawn behind it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LabelPlacement {
    pub origin: (i32, i32),
    pub shadow_top_left: (i32, i32),
    pub shadow_bottom_right: (i32, i32),
}

impl LabelPlacement {
    fn shadow_rect(&self) -> Rect {
        let (x0, y0) = self.shadow_top_left;
        let (x1, y1) = self.shadow_bottom_right;
        let width = (x1 - x0 + 1).max(1) as u32;
        let height = (y1 - y0 + 1).max(1) as u32;
        Rect::at(x0, y0).of_size(width, height)
    }
}

/// Both label rows sit along the bottom edge; right-hand labels are right-aligned.
pub fn place_label(
    corner: LabelCorner,
    image_size: (u32, u32),
    text_width: u32,
    margin: i32,
    font_size: f32,
) -> LabelPlacement {
    let (width, height) = (image_size.0 as i32, image_size.1 as i32);
    let size = font_size.round() as i32;
    let text_width = text_width as i32;

    let x = match corner {
        LabelCorner::UpperLeft | LabelCorner::LowerLeft => margin,
        LabelCorner::UpperRight | LabelCorner::LowerRight => width - text_width - margin,
    };
    let y = match corner {
        LabelCorner::UpperLeft | LabelCorner::UpperRight => height - 2 * (margin + size),
        LabelCorner::LowerLeft | LabelCorner::LowerRight => height - margin - size,
    };

    LabelPlacement {
        origin: (x, y),
        shadow_top_left: (x - 1, y - 1 + (font_size * 0.15).round() as i32),
        shadow_bottom_right: (x + text_width + 1, y + size + 1),
    }
}

pub fn lat_lon_label(lat: Option<f64>, lon: Option<f64>) -> String {
    match (lat, lon) {
        (Some(lat), Some(lon)) if lat != 0.0 && lon != 0.0 => {
            let lat_dir = if lat < 0.0 { 'S' } else { 'N' };
            let lon_dir = if lon < 0.0 { 'W' } else { 'E' };
            format!("{lat_dir} {:.6}°  {lon_dir} {:.6}°", lat.abs(), lon.abs())
        }
        _ => UNKNOWN_LOCATION_LABEL.to_string(),
    }
}

pub fn date_label(date: Option<&str>) -> String {
    match date.map(str::trim).filter(|d| !d.is_empty()) {
        Some(date) => date.to_string(),
        None => UNKNOWN_DATE_LABEL.to_string(),
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// The four label texts in drawing order.
pub fn web_photo_labels(annotation: &PhotoAnnotation) -> [(LabelCorner, String); 4] {
    let tag = non_empty(&annotation.tag).unwrap_or(UNKNOWN_TAG_LABEL);
    let unit = non_empty(&annotation.unit);
    let title = match unit {
        Some(unit) => format!("{unit} - {tag}"),
        None => tag.to_string(),
    };
    let description = non_empty(&annotation.desc).or(unit).unwrap_or_default().to_string();

    [
        (LabelCorner::UpperLeft, title),
        (LabelCorner::UpperRight, description),
        (LabelCorner::LowerLeft, lat_lon_label(annotation.lat, annotation.lon)),
        (LabelCorner::LowerRight, date_label(annotation.date.as_deref())),
    ]
}

/// Scales down to fit the bounds, keeping the aspect ratio; smaller images are untouched.
pub fn shrink_to_fit(image: DynamicImage, max_width: u32, max_height: u32) -> DynamicImage {
    if image.width() <= max_width && image.height() <= max_height {
        return image;
    }
    image.resize(max_width, max_height, FilterType::Lanczos3)
}

pub fn annotate(canvas: &mut RgbImage, annotation: &PhotoAnnotation, style: &WebPhotoStyle) {
    let scale = PxScale::from(style.font_size);
    let size = canvas.dimensions();
    for (corner, text) in web_photo_labels(annotation) {
        if text.is_empty() {
            continue;
        }
        let (text_width, _) = text_size(scale, &style.font, &text);
        let placement = place_label(corner, size, text_width, style.margin, style.font_size);
        draw_filled_rect_mut(canvas, placement.shadow_rect(), Rgb([0, 0, 0]));
        draw_text_mut(
            canvas,
            Rgb([255, 255, 255]),
            placement.origin.0,
            placement.origin.1,
            scale,
            &style.font,
            &text,
        );
    }
}

/// Opens, orients, shrinks, annotates and saves one web photo.
pub fn render_web_photo(
    source: &Path,
    destination: &Path,
    annotation: &PhotoAnnotation,
    style: &WebPhotoStyle,
) -> Result<()> {
    let mut decoder = ImageReader::open(source)
        .with_context(|| format!("opening {}", source.display()))?
        .with_guessed_format()
        .with_context(|| format!("detecting format of {}", source.display()))?
        .into_decoder()
        .with_context(|| format!("decoding {}", source.display()))?;
    let orientation = decoder
        .orientation()
        .with_context(|| format!("reading orientation of {}", source.display()))?;
    let mut image = DynamicImage::from_decoder(decoder).with_context(|| format!("decoding {}", source.display()))?;
    image.apply_orientation(orientation);

    let mut canvas = shrink_to_fit(image, style.max_width, style.max_height).to_rgb8();
    annotate(&mut canvas, annotation, style);
    save_web_photo(&canvas, destination)
}

/// Encodes beside `destination` and renames into place; a failed write leaves no destination file.
pub fn save_web_photo(canvas: &RgbImage, destination: &Path) -> Result<()> {
    let format = ImageFormat::from_path(destination)
        .with_context(|| format!("choosing an encoder for {}", destination.display()))?;
    let file_name = destination
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp_path = destination.with_file_name(format!(".{file_name}.tmp"));

    let written = canvas
        .save_with_format(&temp_path, format)
        .with_context(|| format!("saving {}", temp_path.display()))
        .and_then(|()| {
            fs::rename(&temp_path, destination)
                .with_context(|| format!("renaming {} -> {}", temp_path.display(), destination.display()))
        });
    if written.is_err() {
        let _ = fs::remove_file(&temp_path);
    }
    written
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebPhotoTask {
    /// Folder below `ORIGINAL`, with forward slashes.
    pub folder: String,
    pub photo: String,
    pub source: PathBuf,
    pub destination: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WebPhotoPlan {
    pub folders: Vec<String>,
    pub tasks: Vec<WebPhotoTask>,
    pub up_to_date: usize,
}

/// Mirrors every folder below `original_dir` into `web_dir` and lists the JPEGs without a web copy.
pub fn plan_web_photos(original_dir: &Path, web_dir: &Path) -> Result<WebPhotoPlan> {
    fs::create_dir_all(web_dir).with_context(|| format!("creating {}", web_dir.display()))?;
    let mut plan = WebPhotoPlan::default();

    for entry in WalkDir::new(original_dir).min_depth(1).sort_by_file_name() {
        let entry = entry.with_context(|| format!("walking {}", original_dir.display()))?;
        if !entry.file_type().is_dir() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(original_dir)
            .with_context(|| format!("relativizing {}", entry.path().display()))?;
        let folder = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        let web_folder = web_dir.join(relative);
        fs::create_dir_all(&web_folder).with_context(|| format!("creating {}", web_folder.display()))?;

        let mut photos = fs::read_dir(entry.path())
            .with_context(|| format!("reading {}", entry.path().display()))?
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|ft| ft.is_file()).unwrap_or(false))
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|name| is_jpeg(name))
            .collect::<Vec<_>>();
        photos.sort();

        for photo in photos {
            let destination = web_folder.join(&photo);
            if destination.exists() {
                plan.up_to_date += 1;
                continue;
            }
            plan.tasks.push(WebPhotoTask {
                folder: folder.clone(),
                source: entry.path().join(&photo),
                destination,
                photo,
            });
        }
        plan.folders.push(folder);
    }
    Ok(plan)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WebPhotoSummary {
    pub original_missing: bool,
    pub folders: usize,
    pub created: usize,
    pub up_to_date: usize,
    pub unmatched: usize,
    pub failed: usize,
}

pub async fn make_web_photos<A: AttachmentStore + ?Sized>(
    store: &mut A,
    original_dir: &Path,
    web_dir: &Path,
    style: &WebPhotoStyle,
) -> Result<WebPhotoSummary> {
    if !original_dir.exists() {
        warn!(path = %original_dir.display(), "photo directory does not exist");
        return Ok(WebPhotoSummary {
            original_missing: true,
            ..WebPhotoSummary::default()
        });
    }

    let plan = plan_web_photos(original_dir, web_dir)?;
    let mut summary = WebPhotoSummary {
        folders: plan.folders.len(),
        up_to_date: plan.up_to_date,
        ..WebPhotoSummary::default()
    };
    info!(folders = summary.folders, pending = plan.tasks.len(), "web photos planned");

    for task in &plan.tasks {
        let annotation = match store.photo_annotation(&task.folder, &task.photo).await {
            Ok(Some(annotation)) => annotation,
            Ok(None) => {
                summary.unmatched += 1;
                PhotoAnnotation::unknown(&task.folder)
            }
            Err(err) => {
                warn!(folder = %task.folder, photo = %task.photo, error = %err, "annotation lookup failed");
                summary.unmatched += 1;
                PhotoAnnotation::unknown(&task.folder)
            }
        };

        match render_web_photo(&task.source, &task.destination, &annotation, style) {
            Ok(()) => {
                debug!(path = %task.destination.display(), "web photo created");
                summary.created += 1;
            }
            Err(err) => {
                warn!(error = %format!("{err:#}"), "Cannot create thumbnail for {}", task.source.display());
                summary.failed += 1;
            }
        }
    }
    Ok(summary)
}
