// src/storage/mod.rs
use crate::pipeline::model::{
    ExtractedRecord, FailureMarker, GoldenRecordTable, SourceReport, StatementType,
};
use crate::pipeline::schema::SchemaMap;
use crate::utils::error::StorageError;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

const FAILED_SUFFIX: &str = ".FAILED";
const SCHEMA_MAP_FILE: &str = "schema_map.json";

static REPORT_FILE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([A-Z0-9.\-]+)_(\d{4})_annual_report\.pdf$").expect("Failed to compile REPORT_FILE_RE")
});

pub struct StorageManager {
    base_dir: PathBuf,
}

impl StorageManager {
    /// Creates a new StorageManager with the specified base directory
    pub fn new<P: AsRef<Path>>(base_dir: P) -> Result<Self, StorageError> {
        let base_path = base_dir.as_ref().to_path_buf();

        // Create the base directory if it doesn't exist
        if !base_path.exists() {
            fs::create_dir_all(&base_path)?;
        }

        Ok(Self { base_dir: base_path })
    }

    /// Creates the directory layout for one company:
    /// `<base>/<TICKER>/{annual_reports, financial_statements/<subdir>, unified_statements}`
    pub fn company(&self, ticker: &str) -> Result<CompanyStore, StorageError> {
        let ticker = ticker.to_uppercase();
        let root = self.base_dir.join(&ticker);
        let store = CompanyStore {
            reports_dir: root.join("annual_reports"),
            statements_dir: root.join("financial_statements"),
            unified_dir: root.join("unified_statements"),
            ticker,
        };

        fs::create_dir_all(&store.reports_dir)?;
        fs::create_dir_all(&store.unified_dir)?;
        for statement in StatementType::ALL {
            fs::create_dir_all(store.statements_dir.join(statement.subdir()))?;
        }
        Ok(store)
    }
}

/// On-disk artifacts of one company's run.
pub struct CompanyStore {
    ticker: String,
    reports_dir: PathBuf,
    statements_dir: PathBuf,
    unified_dir: PathBuf,
}

impl CompanyStore {
    pub fn ticker(&self) -> &str {
        &self.ticker
    }

    pub fn reports_dir(&self) -> &Path {
        &self.reports_dir
    }

    pub fn unified_dir(&self) -> &Path {
        &self.unified_dir
    }

    pub fn report_path(&self, report: &SourceReport) -> PathBuf {
        self.reports_dir.join(&report.file_name)
    }

    /// Reports already downloaded for this company whose publication year
    /// matches `year_filter`.
    pub fn list_reports(&self, year_filter: &Regex) -> Result<Vec<SourceReport>, StorageError> {
        let mut reports = Vec::new();
        for entry in fs::read_dir(&self.reports_dir)? {
            let name = entry?.file_name().to_string_lossy().to_string();
            let Some(caps) = REPORT_FILE_RE.captures(&name) else { continue };
            if caps[1] != self.ticker || !year_filter.is_match(&caps[2]) {
                continue;
            }
            if let Ok(year) = caps[2].parse::<u32>() {
                reports.push(SourceReport { file_name: name.clone(), published_year: year });
            }
        }
        reports.sort_by_key(|r| r.published_year);
        Ok(reports)
    }

    fn unit_prefix(&self, report: &SourceReport, statement: StatementType) -> String {
        format!("{}_{}_{}_", self.ticker, report.published_year, statement.subdir())
    }

    fn record_path(&self, report_year: u32, statement: StatementType, fiscal_year: u32) -> PathBuf {
        self.statements_dir.join(statement.subdir()).join(format!(
            "{}_{}_{}_{}.json",
            self.ticker, report_year, statement.subdir(), fiscal_year
        ))
    }

    fn marker_path(&self, report_year: u32, statement: StatementType, fiscal_year: u32) -> PathBuf {
        let mut path = self.record_path(report_year, statement, fiscal_year).into_os_string();
        path.push(FAILED_SUFFIX);
        PathBuf::from(path)
    }

    fn report_year_of(source_file: &str) -> Option<u32> {
        REPORT_FILE_RE
            .captures(source_file)
            .and_then(|caps| caps[2].parse().ok())
    }

    /// Writes a validated record and removes any stale failure marker for the
    /// same unit.
    pub fn save_record(&self, record: &ExtractedRecord) -> Result<PathBuf, StorageError> {
        let report_year = Self::report_year_of(&record.source_file).unwrap_or(record.fiscal_year);
        let path = self.record_path(report_year, record.statement_type, record.fiscal_year);
        fs::write(&path, serde_json::to_string_pretty(record)?)?;

        let marker = self.marker_path(report_year, record.statement_type, record.fiscal_year);
        if marker.exists() {
            fs::remove_file(&marker)?;
            tracing::debug!("Removed stale failure marker {}", marker.display());
        }
        tracing::debug!("Saved {} to {}", record.unit_key(), path.display());
        Ok(path)
    }

    /// Persists a terminal-failure marker in place of the unit's record.
    pub fn save_failure_marker(&self, marker: &FailureMarker) -> Result<PathBuf, StorageError> {
        let unit = &marker.unit;
        let report_year = Self::report_year_of(&unit.source_file).unwrap_or(unit.fiscal_year);
        let path = self.marker_path(report_year, unit.statement_type, unit.fiscal_year);
        fs::write(&path, serde_json::to_string_pretty(marker)?)?;

        let record = self.record_path(report_year, unit.statement_type, unit.fiscal_year);
        if record.exists() {
            fs::remove_file(&record)?;
        }
        tracing::info!("Marked {} as failed: {}", unit, path.display());
        Ok(path)
    }

    /// Records persisted by earlier runs for one (report, statement) pair.
    /// Unreadable files are skipped with a warning.
    pub fn load_records(
        &self,
        report: &SourceReport,
        statement: StatementType,
    ) -> Result<Vec<ExtractedRecord>, StorageError> {
        let mut records = Vec::new();
        for (path, failed) in self.unit_files(report, statement)? {
            if failed {
                continue;
            }
            let parsed = fs::read_to_string(&path)
                .map_err(StorageError::from)
                .and_then(|text| serde_json::from_str::<ExtractedRecord>(&text).map_err(StorageError::from));
            match parsed {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!("Could not read cached record {}: {}", path.display(), e),
            }
        }
        records.sort_by_key(|r| r.fiscal_year);
        Ok(records)
    }

    /// Fiscal years of this pair that carry a `.FAILED` marker.
    pub fn flagged_years(
        &self,
        report: &SourceReport,
        statement: StatementType,
    ) -> Result<BTreeSet<u32>, StorageError> {
        let prefix = self.unit_prefix(report, statement);
        let mut years = BTreeSet::new();
        for (path, failed) in self.unit_files(report, statement)? {
            if !failed {
                continue;
            }
            let name = path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
            let year = name
                .strip_prefix(&prefix)
                .and_then(|rest| rest.strip_suffix(".json.FAILED"))
                .and_then(|y| y.parse::<u32>().ok());
            if let Some(year) = year {
                years.insert(year);
            }
        }
        Ok(years)
    }

    /// (path, is_failure_marker) for every unit file of one pair.
    fn unit_files(
        &self,
        report: &SourceReport,
        statement: StatementType,
    ) -> Result<Vec<(PathBuf, bool)>, StorageError> {
        let prefix = self.unit_prefix(report, statement);
        let dir = self.statements_dir.join(statement.subdir());
        let mut files = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            let name = path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
            if !name.starts_with(&prefix) {
                continue;
            }
            if name.ends_with(".json") {
                files.push((path, false));
            } else if name.ends_with(FAILED_SUFFIX) {
                files.push((path, true));
            }
        }
        files.sort();
        Ok(files)
    }

    /// Deletes every `.FAILED` marker so flagged units are extracted again.
    pub fn clear_failure_markers(&self) -> Result<usize, StorageError> {
        let mut removed = 0;
        for statement in StatementType::ALL {
            for entry in fs::read_dir(self.statements_dir.join(statement.subdir()))? {
                let path = entry?.path();
                if path.to_string_lossy().ends_with(FAILED_SUFFIX) {
                    tracing::debug!("Removing failure marker {}", path.display());
                    fs::remove_file(&path)?;
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            tracing::info!("Cleaned up {} failure markers", removed);
        }
        Ok(removed)
    }

    pub fn load_schema_map(&self) -> Result<Option<SchemaMap>, StorageError> {
        let path = self.unified_dir.join(SCHEMA_MAP_FILE);
        if !path.exists() {
            return Ok(None);
        }
        tracing::debug!("Loading existing schema map from {}", path.display());
        let text = fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&text)?))
    }

    pub fn save_schema_map(&self, map: &SchemaMap) -> Result<PathBuf, StorageError> {
        let path = self.unified_dir.join(SCHEMA_MAP_FILE);
        fs::write(&path, serde_json::to_string_pretty(map)?)?;
        tracing::info!("Saved schema map to {}", path.display());
        Ok(path)
    }

    /// Writes `unified_<statement>.csv`: `year`, `file_source`, then one
    /// column per canonical label; absent values are empty cells.
    pub fn write_unified_table(&self, table: &GoldenRecordTable) -> Result<PathBuf, StorageError> {
        let path = self.unified_dir.join(table.statement_type.unified_file_name());
        let mut writer = csv::Writer::from_path(&path)?;

        let mut header = vec!["year".to_string(), "file_source".to_string()];
        header.extend(table.columns.iter().cloned());
        writer.write_record(&header)?;

        for row in &table.rows {
            let mut fields = vec![row.fiscal_year.to_string(), row.source_file.clone()];
            fields.extend(
                table
                    .columns
                    .iter()
                    .map(|c| row.values.get(c).map(|v| format_value(*v)).unwrap_or_default()),
            );
            writer.write_record(&fields)?;
        }
        writer.flush()?;

        tracing::info!("Unified {} saved to {}", table.statement_type, path.display());
        Ok(path)
    }

    /// Deletes `unified_<statement>.csv` if present; returns whether it existed.
    pub fn remove_unified_table(&self, statement: StatementType) -> Result<bool, StorageError> {
        let path = self.unified_dir.join(statement.unified_file_name());
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(&path)?;
        Ok(true)
    }
}

/// Whole numbers are written without a fractional part.
fn format_value(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{}", value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::model::{GoldenRow, RecordStatus};
    use chrono::Utc;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> CompanyStore {
        StorageManager::new(dir.path()).unwrap().company("tst").unwrap()
    }

    fn record(report_year: u32, fiscal_year: u32) -> ExtractedRecord {
        let mut r = ExtractedRecord::new(
            StatementType::BalanceSheet,
            fiscal_year,
            SourceReport::new("TST", report_year).file_name,
            BTreeMap::from([("Total assets".to_string(), 42.0)]),
        );
        r.status = RecordStatus::Valid;
        r
    }

    #[test]
    fn test_company_layout_created() {
        let dir = TempDir::new().unwrap();
        let _store = store(&dir);
        let root = dir.path().join("TST");
        assert!(root.join("annual_reports").is_dir());
        assert!(root.join("unified_statements").is_dir());
        assert!(root.join("financial_statements/balance_sheets").is_dir());
        assert!(root.join("financial_statements/cash_flow_statements").is_dir());
    }

    #[test]
    fn test_record_and_marker_replace_each_other() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let report = SourceReport::new("TST", 2024);

        let path = store.save_record(&record(2024, 2023)).unwrap();
        assert!(path.ends_with("balance_sheets/TST_2024_balance_sheets_2023.json"));
        assert_eq!(store.load_records(&report, StatementType::BalanceSheet).unwrap().len(), 1);

        let marker = FailureMarker {
            unit: record(2024, 2023).unit_key(),
            attempts: 3,
            reason: "Missing total_liabilities".to_string(),
            marked_at: Utc::now(),
            last_record: None,
        };
        let marker_path = store.save_failure_marker(&marker).unwrap();
        assert!(marker_path.to_string_lossy().ends_with("TST_2024_balance_sheets_2023.json.FAILED"));
        assert!(!path.exists());
        assert!(store.load_records(&report, StatementType::BalanceSheet).unwrap().is_empty());
        assert_eq!(
            store.flagged_years(&report, StatementType::BalanceSheet).unwrap(),
            BTreeSet::from([2023])
        );

        // A later VALID record clears the marker again.
        store.save_record(&record(2024, 2023)).unwrap();
        assert!(!marker_path.exists());
        assert!(store.flagged_years(&report, StatementType::BalanceSheet).unwrap().is_empty());
    }

    #[test]
    fn test_records_scoped_to_report() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.save_record(&record(2024, 2024)).unwrap();
        store.save_record(&record(2023, 2023)).unwrap();
        fs::write(
            store.statements_dir.join("balance_sheets/TST_2024_balance_sheets_2022.json"),
            "{ not json",
        )
        .unwrap();

        let loaded = store
            .load_records(&SourceReport::new("TST", 2024), StatementType::BalanceSheet)
            .unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].fiscal_year, 2024);
    }

    #[test]
    fn test_clear_failure_markers() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let marker = FailureMarker {
            unit: record(2024, 2023).unit_key(),
            attempts: 3,
            reason: "x".to_string(),
            marked_at: Utc::now(),
            last_record: Some(record(2024, 2023)),
        };
        store.save_failure_marker(&marker).unwrap();
        assert_eq!(store.clear_failure_markers().unwrap(), 1);
        assert_eq!(store.clear_failure_markers().unwrap(), 0);
    }

    #[test]
    fn test_list_reports_filters_ticker_and_year() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        for name in [
            "TST_2024_annual_report.pdf",
            "TST_2019_annual_report.pdf",
            "TST_2012_annual_report.pdf",
            "OTHER_2023_annual_report.pdf",
            "notes.txt",
        ] {
            fs::write(store.reports_dir.join(name), b"%PDF").unwrap();
        }
        let filter = Regex::new(r"\b(201[5-9]|202[0-4])\b").unwrap();
        let years: Vec<u32> = store.list_reports(&filter).unwrap().iter().map(|r| r.published_year).collect();
        assert_eq!(years, vec![2019, 2024]);
    }

    #[test]
    fn test_unified_csv_layout() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let table = GoldenRecordTable {
            statement_type: StatementType::IncomeStatement,
            columns: vec!["net_income".to_string(), "sales".to_string()],
            rows: vec![
                GoldenRow {
                    fiscal_year: 2022,
                    source_file: "TST_2023_annual_report.pdf".to_string(),
                    values: BTreeMap::from([("sales".to_string(), 1500.0)]),
                },
                GoldenRow {
                    fiscal_year: 2023,
                    source_file: "TST_2023_annual_report.pdf".to_string(),
                    values: BTreeMap::from([
                        ("sales".to_string(), 2000.0),
                        ("net_income".to_string(), -12.5),
                    ]),
                },
            ],
        };
        let path = store.write_unified_table(&table).unwrap();
        assert!(path.ends_with("unified_income_statement.csv"));
        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(
            text,
            "year,file_source,net_income,sales\n\
             2022,TST_2023_annual_report.pdf,,1500\n\
             2023,TST_2023_annual_report.pdf,-12.5,2000\n"
        );

        // Writing the same table again yields identical bytes.
        store.write_unified_table(&table).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), text);

        assert!(store.remove_unified_table(StatementType::IncomeStatement).unwrap());
        assert!(!path.exists());
        assert!(!store.remove_unified_table(StatementType::IncomeStatement).unwrap());
    }

    #[test]
    fn test_schema_map_round_trip_through_disk() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        assert!(store.load_schema_map().unwrap().is_none());
        let mut map = SchemaMap::default();
        map.set_statement(StatementType::IncomeStatement, [("net sales", "sales")].into_iter().collect());
        store.save_schema_map(&map).unwrap();
        assert_eq!(store.load_schema_map().unwrap(), Some(map));
    }
}
