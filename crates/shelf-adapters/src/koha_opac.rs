//! Koha OPAC (library catalog HTML) source: search page -> biblionumber -> detail page.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use scraper::{Html, Selector};
use shelf_core::normalize::non_empty_text;
use shelf_storage::HttpFetcher;

use crate::google_books::first_four_digit_year;
use crate::{LookupQuery, MetadataSource, SourceError, VolumeMetadata};

#[derive(Debug, Clone)]
pub struct KohaOpacSource {
    http: Arc<HttpFetcher>,
    base_url: String,
}

impl KohaOpacSource {
    /// `base_url` is the Koha cgi root, e.g. `https://opac.example.edu/cgi-bin/koha`.
    pub fn new(http: Arc<HttpFetcher>, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn search_params(query: &LookupQuery) -> [(&'static str, &str); 2] {
        match query {
            LookupQuery::Isbn(isbn) => [("idx", "nb"), ("q", isbn.as_str())],
            LookupQuery::TitleAuthor { title, .. } => [("idx", "ti"), ("q", title.as_str())],
        }
    }
}

#[async_trait]
impl MetadataSource for KohaOpacSource {
    fn name(&self) -> &'static str {
        "koha-opac"
    }

    fn call_deadline(&self) -> Option<Duration> {
        Some(self.http.call_timeout())
    }

    async fn search(&self, query: &LookupQuery) -> Result<Option<VolumeMetadata>, SourceError> {
        let search_url = format!("{}/opac-search.pl", self.base_url);
        let response = self
            .http
            .get(&search_url, &Self::search_params(query))
            .await?;

        // Single hits redirect straight to the detail page.
        if response.final_url.contains("opac-detail.pl") {
            return parse_detail_page(&response.text());
        }

        let Some(biblionumber) = parse_search_page(&response.text())? else {
            return Ok(None);
        };
        let detail_url = format!("{}/opac-detail.pl", self.base_url);
        let detail = self
            .http
            .get(&detail_url, &[("biblionumber", biblionumber.as_str())])
            .await?;
        parse_detail_page(&detail.text())
    }
}

fn selector(css: &str) -> Result<Selector, SourceError> {
    Selector::parse(css).map_err(|e| SourceError::Message(format!("invalid selector {css}: {e}")))
}

fn select_first_text(document: &Html, css: &str) -> Result<Option<String>, SourceError> {
    let sel = selector(css)?;
    Ok(document
        .select(&sel)
        .next()
        .and_then(|el| non_empty_text(&el.text().collect::<String>())))
}

fn select_all_texts(document: &Html, css: &str) -> Result<Vec<String>, SourceError> {
    let sel = selector(css)?;
    Ok(document
        .select(&sel)
        .filter_map(|el| non_empty_text(&el.text().collect::<String>()))
        .collect())
}

/// First result link's `biblionumber`.
pub fn parse_search_page(html: &str) -> Result<Option<String>, SourceError> {
    let document = Html::parse_document(html);
    let sel = selector("a[href*='opac-detail.pl']")?;
    Ok(document
        .select(&sel)
        .filter_map(|el| el.value().attr("href"))
        .find_map(|href| {
            let (_, tail) = href.split_once("biblionumber=")?;
            let id = tail.split(['&', '#']).next().unwrap_or_default().trim();
            (!id.is_empty()).then(|| id.to_string())
        }))
}

pub fn parse_detail_page(html: &str) -> Result<Option<VolumeMetadata>, SourceError> {
    let document = Html::parse_document(html);
    let volume = VolumeMetadata {
        title: select_first_text(&document, "h1.title")?,
        isbn: select_first_text(&document, "span.results_summary.isbn span[property='isbn']")?,
        authors: select_all_texts(
            &document,
            "span.results_summary.author span[property='name']",
        )?,
        publisher: select_first_text(&document, "span.publisher_name")?,
        year: select_first_text(&document, "span.publisher_date")?
            .as_deref()
            .and_then(first_four_digit_year),
        subjects: select_all_texts(&document, "span.results_summary.subjects a.subject")?,
        summary: select_first_text(&document, "p.marcnote-520")?,
    };

    if volume == VolumeMetadata::default() {
        return Ok(None);
    }
    Ok(Some(volume))
}
