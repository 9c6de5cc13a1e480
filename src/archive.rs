/*!
 * Dissemination archive download and extraction
 *
 * CMS publishes the bulk NPPES file as a monthly zip. The archive holds
 * several CSVs (the main data file, its header-only twin, other names,
 * practice locations, endpoints); exactly one entry must match
 * `<prefix>_pfile_<8 digits>-<8 digits>.<ext>` or the run stops.
 *
 * Downloading requires the `download` feature. Entry selection is always
 * available.
 */

use std::path::{Path, PathBuf};

use chrono::{Datelike, NaiveDate};
use lazy_static::lazy_static;
use regex::Regex;

use crate::{IngestError, Result};

#[cfg(feature = "download")]
use crate::config::ArchiveConfig;
#[cfg(feature = "download")]
use tracing::{info, warn};

#[cfg(all(feature = "download", feature = "progress"))]
use indicatif::{ProgressBar, ProgressStyle};

lazy_static! {
    static ref DEFAULT_SOURCE_PATTERN: Regex =
        Regex::new(r"(?i)^npidata_pfile_\d{8}-\d{8}\.csv$").expect("valid source pattern");
}

/// Pattern for the main data file inside the archive
pub fn source_pattern(prefix: &str, extension: &str) -> Result<Regex> {
    if prefix.eq_ignore_ascii_case("npidata") && extension.eq_ignore_ascii_case("csv") {
        return Ok(DEFAULT_SOURCE_PATTERN.clone());
    }
    let pattern = format!(
        r"(?i)^{}_pfile_\d{{8}}-\d{{8}}\.{}$",
        regex::escape(prefix),
        regex::escape(extension)
    );
    Regex::new(&pattern).map_err(|e| {
        IngestError::invalid_config(
            format!("Invalid archive file pattern '{}': {}", pattern, e),
            Some("Check archive.file_prefix and archive.file_extension"),
        )
    })
}

/// Pick the single archive entry whose file name matches `pattern`.
/// Directory components of entry names are ignored.
pub fn select_source_entry<'a, I>(entries: I, pattern: &Regex) -> Result<&'a str>
where
    I: IntoIterator<Item = &'a str>,
{
    let matches: Vec<&str> = entries
        .into_iter()
        .filter(|name| pattern.is_match(entry_file_name(name)))
        .collect();

    match matches.as_slice() {
        [only] => Ok(only),
        _ => Err(IngestError::ArchiveMatch {
            pattern: pattern.as_str().to_string(),
            matches: matches.iter().map(|s| s.to_string()).collect(),
        }),
    }
}

fn entry_file_name(name: &str) -> &str {
    name.rsplit(['/', '\\']).next().unwrap_or(name)
}

/// URL of the monthly dissemination archive for the month of `date`
pub fn monthly_dissemination_url(date: NaiveDate) -> String {
    format!(
        "https://download.cms.gov/nppes/NPPES_Data_Dissemination_{}_{}_V2.zip",
        date.format("%B"),
        date.year()
    )
}

/// Extract the matching entry of `zip_path` into `dest`, returning its path
#[cfg(feature = "download")]
pub fn extract_source_file(zip_path: &Path, dest: &Path, pattern: &Regex) -> Result<PathBuf> {
    use std::fs::File;
    use std::io::BufReader;
    use zip::ZipArchive;

    let file = File::open(zip_path).map_err(|e| IngestError::io_at(e, zip_path))?;
    let mut archive = ZipArchive::new(BufReader::new(file))?;

    let names: Vec<String> = archive.file_names().map(str::to_string).collect();
    let entry = select_source_entry(names.iter().map(String::as_str), pattern)?.to_string();

    std::fs::create_dir_all(dest).map_err(|e| IngestError::io_at(e, dest))?;
    let out_path = dest.join(entry_file_name(&entry));

    let mut zipped = archive.by_name(&entry)?;
    let mut out = File::create(&out_path).map_err(|e| IngestError::io_at(e, &out_path))?;
    std::io::copy(&mut zipped, &mut out).map_err(|e| IngestError::io_at(e, &out_path))?;

    info!(entry = %entry, path = %out_path.display(), "Extracted source file");
    Ok(out_path)
}

#[cfg(not(feature = "download"))]
pub fn extract_source_file(_zip_path: &Path, _dest: &Path, _pattern: &Regex) -> Result<PathBuf> {
    Err(IngestError::feature_required("download"))
}

/// Downloads the dissemination archive and extracts the main data file
#[cfg(feature = "download")]
pub struct ArchiveFetcher {
    config: ArchiveConfig,
    client: reqwest::Client,
    pattern: Regex,
    show_progress: bool,
}

#[cfg(feature = "download")]
impl ArchiveFetcher {
    pub fn new(config: &ArchiveConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .user_agent(format!("nppes-ingest/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| IngestError::Http {
                message: format!("Failed to create HTTP client: {}", e),
                url: None,
            })?;

        Ok(Self {
            pattern: source_pattern(&config.file_prefix, &config.file_extension)?,
            config: config.clone(),
            client,
            show_progress: true,
        })
    }

    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    /// Configured URL, or this month's dissemination archive
    pub fn source_url(&self) -> String {
        self.config
            .url
            .clone()
            .unwrap_or_else(|| monthly_dissemination_url(chrono::Utc::now().date_naive()))
    }

    /// Stream `url` into the work directory
    pub async fn download(&self, url: &str) -> Result<PathBuf> {
        use futures_util::StreamExt;
        use tokio::io::AsyncWriteExt;

        let work_dir = &self.config.work_dir;
        tokio::fs::create_dir_all(work_dir)
            .await
            .map_err(|e| IngestError::io_at(e, work_dir))?;

        let file_name = url
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .unwrap_or("nppes_download.zip");
        let file_path = work_dir.join(file_name);

        info!(url, "Downloading archive");
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(IngestError::Http {
                message: format!("HTTP error {} downloading archive", response.status()),
                url: Some(url.to_string()),
            });
        }

        #[cfg(feature = "progress")]
        let progress_bar = match (self.show_progress, response.content_length()) {
            (true, Some(total)) => {
                let pb = ProgressBar::new(total);
                pb.set_style(
                    ProgressStyle::default_bar()
                        .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
                        .unwrap_or_else(|_| ProgressStyle::default_bar())
                        .progress_chars("#>-"),
                );
                Some(pb)
            }
            _ => None,
        };

        let mut file = tokio::fs::File::create(&file_path)
            .await
            .map_err(|e| IngestError::io_at(e, &file_path))?;
        let mut downloaded = 0u64;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk)
                .await
                .map_err(|e| IngestError::io_at(e, &file_path))?;
            downloaded += chunk.len() as u64;

            #[cfg(feature = "progress")]
            if let Some(ref pb) = progress_bar {
                pb.set_position(downloaded);
            }
        }
        file.flush().await.map_err(|e| IngestError::io_at(e, &file_path))?;

        #[cfg(feature = "progress")]
        if let Some(pb) = progress_bar {
            pb.finish_with_message("Download complete");
        }

        info!(bytes = downloaded, path = %file_path.display(), "Downloaded archive");
        Ok(file_path)
    }

    /// Extract the main data file from an archive already on disk
    pub async fn extract(&self, zip_path: &Path) -> Result<PathBuf> {
        let zip_path = zip_path.to_path_buf();
        let dest = self.config.work_dir.clone();
        let pattern = self.pattern.clone();
        tokio::task::spawn_blocking(move || extract_source_file(&zip_path, &dest, &pattern))
            .await
            .map_err(|e| IngestError::Custom {
                message: format!("Extraction task failed: {}", e),
                suggestion: None,
            })?
    }

    /// Download, extract, and drop the archive unless configured to keep it
    pub async fn fetch(&self) -> Result<PathBuf> {
        let url = self.source_url();
        let zip_path = self.download(&url).await?;
        let source = self.extract(&zip_path).await?;

        if !self.config.keep_archive {
            if let Err(e) = tokio::fs::remove_file(&zip_path).await {
                warn!(path = %zip_path.display(), "Could not remove archive: {}", e);
            }
        }
        Ok(source)
    }
}

#[cfg(not(feature = "download"))]
pub struct ArchiveFetcher;

#[cfg(not(feature = "download"))]
impl ArchiveFetcher {
    pub fn new(_config: &crate::config::ArchiveConfig) -> Result<Self> {
        Err(IngestError::feature_required("download"))
    }

    pub fn with_progress(self, _show: bool) -> Self {
        self
    }

    pub async fn fetch(&self) -> Result<PathBuf> {
        Err(IngestError::feature_required("download"))
    }
}
