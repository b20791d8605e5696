//! Resolves which dissemination archive a run should ingest.

use nppes_core::IngestError;
use nppes_storage::HttpFetcher;
use regex::Regex;
use reqwest::Url;
use scraper::{Html, Selector};
use tracing::info;

/// Return `explicit` unchanged, otherwise scrape `index_url` for the newest archive link.
pub async fn resolve_archive_url(
    explicit: Option<&str>,
    index_url: &str,
    http: &HttpFetcher,
    archive_name: &Regex,
) -> Result<String, IngestError> {
    if let Some(url) = explicit.filter(|u| !u.trim().is_empty()) {
        return Ok(url.to_string());
    }

    let html = http
        .fetch_text(index_url)
        .await
        .map_err(|err| IngestError::SourceUnavailable(format!("{index_url}: {err}")))?;
    let url = latest_archive_link(&html, index_url, archive_name)?.ok_or_else(|| {
        IngestError::SourceUnavailable(format!("no archive link matching {archive_name} at {index_url}"))
    })?;
    info!(%url, "resolved latest archive");
    Ok(url)
}

/// Absolute URL of the lexicographically greatest matching archive file name.
pub fn latest_archive_link(
    html: &str,
    index_url: &str,
    archive_name: &Regex,
) -> Result<Option<String>, IngestError> {
    let base = Url::parse(index_url)
        .map_err(|err| IngestError::SourceUnavailable(format!("invalid index url {index_url}: {err}")))?;
    let selector = Selector::parse("a[href]")
        .map_err(|err| IngestError::SourceUnavailable(format!("anchor selector: {err}")))?;
    let document = Html::parse_document(html);

    let mut best: Option<(String, Url)> = None;
    for href in document
        .select(&selector)
        .filter_map(|el| el.value().attr("href"))
    {
        let Ok(url) = base.join(href.trim()) else {
            continue;
        };
        let Some(file_name) = url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .map(str::to_string)
        else {
            continue;
        };
        if !archive_name.is_match(&file_name) {
            continue;
        }
        if best.as_ref().map_or(true, |(name, _)| file_name > *name) {
            best = Some((file_name, url));
        }
    }

    Ok(best.map(|(_, url)| url.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::ArchiveLayout;
    use nppes_storage::HttpClientConfig;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const INDEX_HTML: &str = r#"
        <html><body>
          <a href="NPPES_Data_Dissemination_0525.zip">May</a>
          <a href="./NPPES_Data_Dissemination_0625.zip">June</a>
          <a href="/nppes/NPPES_Data_Dissemination_0425.zip">April</a>
          <a href="NPPES_Data_Dissemination_Weekly_0612.zip">Weekly</a>
          <a href="NPPES_Deactivated_NPI_Report_0625.zip">Deactivated</a>
        </body></html>
    "#;

    #[test]
    fn picks_greatest_matching_name() {
        let layout = ArchiveLayout::default();
        let url = latest_archive_link(
            INDEX_HTML,
            "https://download.cms.gov/nppes/NPI_Files.html",
            &layout.archive_name,
        )
        .unwrap();
        assert_eq!(
            url.as_deref(),
            Some("https://download.cms.gov/nppes/NPPES_Data_Dissemination_0625.zip")
        );
    }

    #[test]
    fn no_matching_link_yields_none() {
        let layout = ArchiveLayout::default();
        let url = latest_archive_link(
            "<a href='other.zip'>x</a>",
            "https://example.org/",
            &layout.archive_name,
        )
        .unwrap();
        assert!(url.is_none());
    }

    #[tokio::test]
    async fn explicit_url_is_returned_without_network() {
        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let layout = ArchiveLayout::default();
        let url = resolve_archive_url(
            Some("https://mirror.example/nppes.zip"),
            "http://127.0.0.1:9/unreachable",
            &http,
            &layout.archive_name,
        )
        .await
        .unwrap();
        assert_eq!(url, "https://mirror.example/nppes.zip");
    }

    #[tokio::test]
    async fn index_page_is_scraped() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/nppes/NPI_Files.html"))
            .respond_with(ResponseTemplate::new(200).set_body_string(INDEX_HTML))
            .expect(1)
            .mount(&server)
            .await;

        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let layout = ArchiveLayout::default();
        let url = resolve_archive_url(
            None,
            &format!("{}/nppes/NPI_Files.html", server.uri()),
            &http,
            &layout.archive_name,
        )
        .await
        .unwrap();
        assert_eq!(
            url,
            format!("{}/nppes/NPPES_Data_Dissemination_0625.zip", server.uri())
        );
    }

    #[tokio::test]
    async fn unreachable_index_is_source_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let layout = ArchiveLayout::default();
        let err = resolve_archive_url(
            None,
            &format!("{}/nppes/NPI_Files.html", server.uri()),
            &http,
            &layout.archive_name,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, IngestError::SourceUnavailable(_)));
    }

    #[tokio::test]
    async fn index_without_archive_is_source_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html></html>"))
            .mount(&server)
            .await;

        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let layout = ArchiveLayout::default();
        let err = resolve_archive_url(None, &server.uri(), &http, &layout.archive_name)
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::SourceUnavailable(_)));
    }
}
