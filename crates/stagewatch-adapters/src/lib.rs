//! Source extractors for Swiss job boards.
//!
//! Every extractor turns one search results page into candidate listings. Failures are
//! contained at two levels: a page that cannot be fetched contributes nothing, and a
//! fragment that cannot be read is skipped without affecting its neighbours.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Url;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use stagewatch_core::RawCandidate;
use stagewatch_storage::{FetchedPage, HttpFetcher};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "stagewatch-adapters";

pub const DEFAULT_DOMAIN: &str = "Finance";
pub const DEFAULT_LOCATION: &str = "Switzerland";
pub const DEFAULT_DURATION: &str = "6 mois";
pub const DEFAULT_START_DATE: &str = "Variable";
pub const UNKNOWN_COMPANY: &str = "Entreprise non spécifiée";
pub const DEFAULT_RESULTS_PER_PAGE: usize = 5;

const SWISS_CITIES: &[&str] = &[
    "Zurich", "Zürich", "Geneva", "Genève", "Lausanne", "Basel", "Bern", "Berne",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionContext {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
}

impl ExtractionContext {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
        }
    }
}

impl Default for ExtractionContext {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("fragment has no title")]
    MissingTitle,
    #[error("fragment has no company")]
    MissingCompany,
    #[error("title `{0}` is not an internship or graduate role")]
    OffTopic(String),
    #[error("invalid selector `{selector}`: {message}")]
    Selector { selector: String, message: String },
}

/// Everything one extractor produced during a run.
#[derive(Debug, Clone, Default)]
pub struct ExtractedBatch {
    pub source_id: String,
    pub candidates: Vec<RawCandidate>,
    pub pages: Vec<FetchedPage>,
    pub pages_failed: usize,
    pub fragments_skipped: usize,
}

#[async_trait]
pub trait SourceExtractor: Send + Sync {
    fn source_id(&self) -> &'static str;
    fn display_name(&self) -> &'static str;
    fn base_url(&self) -> &'static str;
    fn search_url(&self, term: &str) -> String;

    /// One entry per listing fragment found on the page.
    fn parse_listing_page(&self, html: &str, page_url: &str)
        -> Vec<Result<RawCandidate, ExtractionError>>;

    /// Fetch and parse one results page per search term. Never fails: an unreachable page
    /// is logged and counted, and the batch simply carries fewer candidates.
    async fn extract(
        &self,
        http: &HttpFetcher,
        ctx: &ExtractionContext,
        terms: &[String],
        per_page_limit: usize,
    ) -> ExtractedBatch {
        let mut batch = ExtractedBatch {
            source_id: self.source_id().to_string(),
            ..ExtractedBatch::default()
        };

        for term in terms {
            let url = self.search_url(term);
            let page = match http.fetch_page(ctx.run_id, self.source_id(), &url).await {
                Ok(page) => page,
                Err(err) => {
                    warn!(
                        source_id = self.source_id(),
                        term = term.as_str(),
                        error = %err,
                        "search page unavailable"
                    );
                    batch.pages_failed += 1;
                    continue;
                }
            };

            let fragments = self.parse_listing_page(&page.body, &page.final_url);
            let (candidates, skipped) = collect_fragments(fragments, per_page_limit);
            info!(
                source_id = self.source_id(),
                term = term.as_str(),
                candidates = candidates.len(),
                skipped,
                "search page parsed"
            );
            batch.candidates.extend(candidates);
            batch.fragments_skipped += skipped;
            batch.pages.push(page);
        }

        batch
    }
}

/// Keep the readable fragments among the first `limit` (0 = no limit) and count the rest.
pub fn collect_fragments(
    fragments: Vec<Result<RawCandidate, ExtractionError>>,
    limit: usize,
) -> (Vec<RawCandidate>, usize) {
    let limit = if limit == 0 { usize::MAX } else { limit };
    let mut candidates = Vec::new();
    let mut skipped = 0usize;
    for fragment in fragments.into_iter().take(limit) {
        match fragment {
            Ok(candidate) => candidates.push(candidate),
            Err(err) => {
                debug!(error = %err, "skipping fragment");
                skipped += 1;
            }
        }
    }
    (candidates, skipped)
}

fn flatten_page(
    parsed: Result<Vec<Result<RawCandidate, ExtractionError>>, ExtractionError>,
) -> Vec<Result<RawCandidate, ExtractionError>> {
    parsed.unwrap_or_else(|err| vec![Err(err)])
}

fn candidate(
    company: Option<String>,
    title: String,
    location: Option<String>,
    link: String,
) -> RawCandidate {
    RawCandidate {
        company: Some(company.unwrap_or_else(|| UNKNOWN_COMPANY.to_string())),
        title: Some(title),
        domain: Some(DEFAULT_DOMAIN.to_string()),
        location: Some(location.unwrap_or_else(|| DEFAULT_LOCATION.to_string())),
        duration: Some(DEFAULT_DURATION.to_string()),
        start_date: Some(DEFAULT_START_DATE.to_string()),
        link: Some(link),
    }
}

fn sel(css: &str) -> Result<Selector, ExtractionError> {
    Selector::parse(css).map_err(|e| ExtractionError::Selector {
        selector: css.to_string(),
        message: e.to_string(),
    })
}

fn text_or_none(value: &str) -> Option<String> {
    let collapsed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

fn element_text(element: ElementRef<'_>) -> Option<String> {
    text_or_none(&element.text().collect::<String>())
}

fn first_text(scope: ElementRef<'_>, css: &str) -> Result<Option<String>, ExtractionError> {
    let selector = sel(css)?;
    Ok(scope.select(&selector).find_map(element_text))
}

fn first_attr(scope: ElementRef<'_>, css: &str, attr: &str) -> Result<Option<String>, ExtractionError> {
    let selector = sel(css)?;
    Ok(scope
        .select(&selector)
        .find_map(|n| n.value().attr(attr))
        .and_then(text_or_none))
}

fn is_leaf(element: ElementRef<'_>) -> bool {
    !element.children().any(|child| child.value().is_element())
}

/// Text of the first childless element matched by `css` whose text satisfies `predicate`.
fn first_leaf_text_matching(
    scope: ElementRef<'_>,
    css: &str,
    predicate: impl Fn(&str) -> bool,
) -> Result<Option<String>, ExtractionError> {
    let selector = sel(css)?;
    Ok(scope
        .select(&selector)
        .filter(|el| is_leaf(*el))
        .filter_map(element_text)
        .find(|text| predicate(text)))
}

fn has_token(text: &str, tokens: &[&str]) -> bool {
    text.split(|c: char| !c.is_alphanumeric())
        .any(|word| tokens.contains(&word))
}

fn first_city_text(scope: ElementRef<'_>) -> Option<String> {
    scope
        .text()
        .filter_map(text_or_none)
        .find(|text| SWISS_CITIES.iter().any(|city| text.contains(city)))
}

fn resolve_link(page_url: &str, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() || href.starts_with('#') || href.starts_with("javascript:") {
        return None;
    }
    let base = Url::parse(page_url).ok()?;
    base.join(href).ok().map(|url| url.to_string())
}

fn link_or_page(scope: ElementRef<'_>, css: &str, page_url: &str) -> Result<String, ExtractionError> {
    Ok(first_attr(scope, css, "href")?
        .and_then(|href| resolve_link(page_url, &href))
        .unwrap_or_else(|| page_url.to_string()))
}

fn build_search_url(base: &str, params: &[(&str, &str)]) -> String {
    Url::parse_with_params(base, params)
        .map(|url| url.to_string())
        .unwrap_or_else(|_| base.to_string())
}

/// jobs.ch: `article.job-item` cards, or bare `/job/` anchors on the newer layout.
#[derive(Debug, Clone, Copy, Default)]
pub struct JobsChExtractor;

impl JobsChExtractor {
    fn parse_page(
        &self,
        html: &str,
        page_url: &str,
    ) -> Result<Vec<Result<RawCandidate, ExtractionError>>, ExtractionError> {
        let document = Html::parse_document(html);
        let root = document.root_element();

        let cards = root.select(&sel("article.job-item")?).collect::<Vec<_>>();
        if !cards.is_empty() {
            return Ok(cards
                .into_iter()
                .map(|card| self.parse_card(card, page_url))
                .collect());
        }

        let anchors = sel(r#"a[href*="/job/"]"#)?;
        Ok(root
            .select(&anchors)
            .map(|anchor| self.parse_job_anchor(anchor, page_url))
            .collect())
    }

    fn parse_card(&self, card: ElementRef<'_>, page_url: &str) -> Result<RawCandidate, ExtractionError> {
        let title = first_text(card, "h2")?.ok_or(ExtractionError::MissingTitle)?;
        let company = first_text(card, "span.company")?.ok_or(ExtractionError::MissingCompany)?;
        let location = first_text(card, "span.location")?;
        let link = link_or_page(card, "a[href]", page_url)?;
        Ok(candidate(Some(company), title, location, link))
    }

    fn parse_job_anchor(
        &self,
        anchor: ElementRef<'_>,
        page_url: &str,
    ) -> Result<RawCandidate, ExtractionError> {
        let title = element_text(anchor).ok_or(ExtractionError::MissingTitle)?;
        let company = match anchor.parent().and_then(ElementRef::wrap) {
            Some(parent) => first_text(parent, r#"span[class*="company" i]"#)?,
            None => None,
        };
        let link = anchor
            .value()
            .attr("href")
            .and_then(|href| resolve_link(page_url, href))
            .unwrap_or_else(|| page_url.to_string());
        Ok(candidate(company, title, None, link))
    }
}

#[async_trait]
impl SourceExtractor for JobsChExtractor {
    fn source_id(&self) -> &'static str {
        "jobs-ch"
    }

    fn display_name(&self) -> &'static str {
        "Jobs.ch"
    }

    fn base_url(&self) -> &'static str {
        "https://www.jobs.ch"
    }

    fn search_url(&self, term: &str) -> String {
        build_search_url("https://www.jobs.ch/en/vacancies/", &[("term", term)])
    }

    fn parse_listing_page(
        &self,
        html: &str,
        page_url: &str,
    ) -> Vec<Result<RawCandidate, ExtractionError>> {
        flatten_page(self.parse_page(html, page_url))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JobupChExtractor;

impl JobupChExtractor {
    fn parse_page(
        &self,
        html: &str,
        page_url: &str,
    ) -> Result<Vec<Result<RawCandidate, ExtractionError>>, ExtractionError> {
        let document = Html::parse_document(html);
        let cards = sel(r#"article[class*="job" i], div[class*="job" i]"#)?;
        Ok(document
            .root_element()
            .select(&cards)
            .map(|card| self.parse_card(card, page_url))
            .collect())
    }

    fn parse_card(&self, card: ElementRef<'_>, page_url: &str) -> Result<RawCandidate, ExtractionError> {
        let title = first_text(card, "h2, h3, a")?.ok_or(ExtractionError::MissingTitle)?;
        let company = first_text(
            card,
            r#"span[class*="company" i], div[class*="company" i], p[class*="company" i],
               span[class*="employer" i], div[class*="employer" i], p[class*="employer" i]"#,
        )?;
        let location = first_text(card, r#"span[class*="location" i], div[class*="location" i]"#)?;
        let link = link_or_page(card, "a[href]", page_url)?;
        Ok(candidate(company, title, location, link))
    }
}

#[async_trait]
impl SourceExtractor for JobupChExtractor {
    fn source_id(&self) -> &'static str {
        "jobup-ch"
    }

    fn display_name(&self) -> &'static str {
        "Jobup.ch"
    }

    fn base_url(&self) -> &'static str {
        "https://www.jobup.ch"
    }

    fn search_url(&self, term: &str) -> String {
        build_search_url("https://www.jobup.ch/en/jobs/", &[("term", term)])
    }

    fn parse_listing_page(
        &self,
        html: &str,
        page_url: &str,
    ) -> Vec<Result<RawCandidate, ExtractionError>> {
        flatten_page(self.parse_page(html, page_url))
    }
}

/// travail.swiss, the federal job portal. Employers are recognised by their legal form.
#[derive(Debug, Clone, Copy, Default)]
pub struct TravailSwissExtractor;

impl TravailSwissExtractor {
    const LEGAL_FORMS: &'static [&'static str] = &["SA", "AG", "GmbH", "Ltd"];

    fn parse_page(
        &self,
        html: &str,
        page_url: &str,
    ) -> Result<Vec<Result<RawCandidate, ExtractionError>>, ExtractionError> {
        let document = Html::parse_document(html);
        let cards = sel(
            r#"article[class*="job" i], li[class*="job" i], div[class*="job" i],
               article[class*="listing" i], li[class*="listing" i], div[class*="listing" i]"#,
        )?;
        Ok(document
            .root_element()
            .select(&cards)
            .map(|card| self.parse_card(card, page_url))
            .collect())
    }

    fn parse_card(&self, card: ElementRef<'_>, page_url: &str) -> Result<RawCandidate, ExtractionError> {
        let title = first_text(card, "h2, h3, h4, a, strong")?.ok_or(ExtractionError::MissingTitle)?;
        let company = match first_leaf_text_matching(card, "span, div, p", |text| {
            has_token(text, Self::LEGAL_FORMS)
        })? {
            Some(company) => Some(company),
            None => first_text(card, r#"span[class*="company" i], div[class*="company" i]"#)?,
        };
        let location = first_city_text(card);
        let link = link_or_page(card, "a[href]", page_url)?;
        Ok(candidate(company, title, location, link))
    }
}

#[async_trait]
impl SourceExtractor for TravailSwissExtractor {
    fn source_id(&self) -> &'static str {
        "travail-swiss"
    }

    fn display_name(&self) -> &'static str {
        "Travail.swiss"
    }

    fn base_url(&self) -> &'static str {
        "https://www.travail.swiss"
    }

    fn search_url(&self, term: &str) -> String {
        build_search_url("https://www.travail.swiss/job-search/", &[("keywords", term)])
    }

    fn parse_listing_page(
        &self,
        html: &str,
        page_url: &str,
    ) -> Vec<Result<RawCandidate, ExtractionError>> {
        flatten_page(self.parse_page(html, page_url))
    }
}

/// eFinancialCareers lists every seniority; only internship-type titles are kept.
#[derive(Debug, Clone, Copy, Default)]
pub struct EFinancialCareersExtractor;

impl EFinancialCareersExtractor {
    const RELEVANT_WORDS: &'static [&'static str] = &["intern", "stage", "trainee", "graduate"];
    const EMPLOYER_WORDS: &'static [&'static str] = &["Bank", "Group", "AG", "SA"];

    fn parse_page(
        &self,
        html: &str,
        page_url: &str,
    ) -> Result<Vec<Result<RawCandidate, ExtractionError>>, ExtractionError> {
        let document = Html::parse_document(html);
        let cards = sel(
            r#"article[class*="job" i], div[class*="job" i], li[class*="job" i],
               article[class*="result" i], div[class*="result" i], li[class*="result" i]"#,
        )?;
        Ok(document
            .root_element()
            .select(&cards)
            .map(|card| self.parse_card(card, page_url))
            .collect())
    }

    fn parse_card(&self, card: ElementRef<'_>, page_url: &str) -> Result<RawCandidate, ExtractionError> {
        let title = match first_text(
            card,
            r#"h2[class*="title" i], h3[class*="title" i], a[class*="title" i]"#,
        )? {
            Some(title) => title,
            None => first_text(card, "h2, h3, a")?.ok_or(ExtractionError::MissingTitle)?,
        };
        let lowered = title.to_lowercase();
        if !Self::RELEVANT_WORDS.iter().any(|word| lowered.contains(word)) {
            return Err(ExtractionError::OffTopic(title));
        }

        let company = match first_text(
            card,
            r#"span[class*="company" i], div[class*="company" i], p[class*="company" i],
               span[class*="employer" i], div[class*="employer" i], p[class*="employer" i]"#,
        )? {
            Some(company) => Some(company),
            None => first_leaf_text_matching(card, "span, div", |text| {
                has_token(text, Self::EMPLOYER_WORDS)
            })?,
        };
        let location = first_text(card, r#"span[class*="location" i], div[class*="location" i]"#)?;
        let link = link_or_page(card, "a[href]", page_url)?;
        Ok(candidate(company, title, location, link))
    }
}

#[async_trait]
impl SourceExtractor for EFinancialCareersExtractor {
    fn source_id(&self) -> &'static str {
        "efinancialcareers-ch"
    }

    fn display_name(&self) -> &'static str {
        "eFinancialCareers.ch"
    }

    fn base_url(&self) -> &'static str {
        "https://www.efinancialcareers.ch"
    }

    fn search_url(&self, term: &str) -> String {
        build_search_url(
            "https://www.efinancialcareers.ch/jobs/search",
            &[("keywords", term), ("location", "Switzerland")],
        )
    }

    fn parse_listing_page(
        &self,
        html: &str,
        page_url: &str,
    ) -> Vec<Result<RawCandidate, ExtractionError>> {
        flatten_page(self.parse_page(html, page_url))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct IndeedChExtractor;

impl IndeedChExtractor {
    fn parse_page(
        &self,
        html: &str,
        page_url: &str,
    ) -> Result<Vec<Result<RawCandidate, ExtractionError>>, ExtractionError> {
        let document = Html::parse_document(html);
        let cards = sel("div.job_seen_beacon")?;
        Ok(document
            .root_element()
            .select(&cards)
            .map(|card| self.parse_card(card, page_url))
            .collect())
    }

    fn parse_card(&self, card: ElementRef<'_>, page_url: &str) -> Result<RawCandidate, ExtractionError> {
        let title = first_text(card, "h2.jobTitle")?.ok_or(ExtractionError::MissingTitle)?;
        let company = first_text(card, "span.companyName")?.ok_or(ExtractionError::MissingCompany)?;
        let location = first_text(card, "div.companyLocation")?;
        let link = link_or_page(card, "h2.jobTitle a[href]", page_url)?;
        Ok(candidate(Some(company), title, location, link))
    }
}

#[async_trait]
impl SourceExtractor for IndeedChExtractor {
    fn source_id(&self) -> &'static str {
        "indeed-ch"
    }

    fn display_name(&self) -> &'static str {
        "Indeed CH"
    }

    fn base_url(&self) -> &'static str {
        "https://ch.indeed.com"
    }

    fn search_url(&self, term: &str) -> String {
        build_search_url("https://ch.indeed.com/jobs", &[("q", term), ("l", "Switzerland")])
    }

    fn parse_listing_page(
        &self,
        html: &str,
        page_url: &str,
    ) -> Vec<Result<RawCandidate, ExtractionError>> {
        flatten_page(self.parse_page(html, page_url))
    }
}

pub fn extractor_for_source(source_id: &str) -> Option<Box<dyn SourceExtractor>> {
    match source_id {
        "jobs-ch" => Some(Box::new(JobsChExtractor)),
        "jobup-ch" => Some(Box::new(JobupChExtractor)),
        "travail-swiss" => Some(Box::new(TravailSwissExtractor)),
        "efinancialcareers-ch" => Some(Box::new(EFinancialCareersExtractor)),
        "indeed-ch" => Some(Box::new(IndeedChExtractor)),
        _ => None,
    }
}

pub fn all_extractors() -> Vec<Box<dyn SourceExtractor>> {
    vec![
        Box::new(JobsChExtractor),
        Box::new(JobupChExtractor),
        Box::new(TravailSwissExtractor),
        Box::new(EFinancialCareersExtractor),
        Box::new(IndeedChExtractor),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use stagewatch_storage::{BackoffPolicy, HttpClientConfig};
    use std::time::Duration;

    fn ok_candidates(results: Vec<Result<RawCandidate, ExtractionError>>) -> Vec<RawCandidate> {
        results.into_iter().filter_map(Result::ok).collect()
    }

    #[test]
    fn registry_resolves_every_known_source() {
        for extractor in all_extractors() {
            let resolved = extractor_for_source(extractor.source_id()).expect("registered");
            assert_eq!(resolved.display_name(), extractor.display_name());
        }
        assert!(extractor_for_source("linkedin").is_none());
    }

    #[test]
    fn search_urls_are_form_encoded() {
        assert_eq!(
            JobsChExtractor.search_url("stage finance geneva"),
            "https://www.jobs.ch/en/vacancies/?term=stage+finance+geneva"
        );
        assert_eq!(
            IndeedChExtractor.search_url("finance internship"),
            "https://ch.indeed.com/jobs?q=finance+internship&l=Switzerland"
        );
        assert_eq!(
            TravailSwissExtractor.search_url("stagiaire comptabilité"),
            "https://www.travail.swiss/job-search/?keywords=stagiaire+comptabilit%C3%A9"
        );
    }

    #[test]
    fn relative_links_resolve_against_the_page() {
        let page = "https://www.jobs.ch/en/vacancies/?term=finance";
        assert_eq!(
            resolve_link(page, "/en/vacancies/detail/42/").as_deref(),
            Some("https://www.jobs.ch/en/vacancies/detail/42/")
        );
        assert_eq!(
            resolve_link(page, "https://other.ch/job/1").as_deref(),
            Some("https://other.ch/job/1")
        );
        assert_eq!(resolve_link(page, "#top"), None);
        assert_eq!(resolve_link("not a url", "/job/1"), None);
    }

    #[test]
    fn collect_fragments_applies_limit_and_counts_skips() {
        let fragments = vec![
            Ok(candidate(None, "Finance Intern A".into(), None, "https://x".into())),
            Err(ExtractionError::MissingTitle),
            Ok(candidate(None, "Finance Intern B".into(), None, "https://x".into())),
            Ok(candidate(None, "Finance Intern C".into(), None, "https://x".into())),
        ];
        let (kept, skipped) = collect_fragments(fragments, 3);
        assert_eq!(kept.len(), 2);
        assert_eq!(skipped, 1);

        let (all, _) = collect_fragments(
            vec![Ok(RawCandidate::default()), Ok(RawCandidate::default())],
            0,
        );
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn jobs_ch_cards_require_company_and_title() {
        let html = r#"
            <article class="job-item">
              <a href="/en/vacancies/detail/1/"><h2>Finance Internship  (80-100%)</h2></a>
              <span class="company">UBS AG</span><span class="location">Zürich</span>
            </article>
            <article class="job-item"><h2>Orphan Trainee Role</h2></article>
            <article class="job-item"><span class="company">Nestlé</span></article>
        "#;
        let results = JobsChExtractor.parse_listing_page(html, "https://www.jobs.ch/en/vacancies/?term=x");
        assert_eq!(results.len(), 3);
        assert!(matches!(results[1], Err(ExtractionError::MissingCompany)));
        assert!(matches!(results[2], Err(ExtractionError::MissingTitle)));

        let first = results.into_iter().next().unwrap().unwrap();
        assert_eq!(first.title.as_deref(), Some("Finance Internship (80-100%)"));
        assert_eq!(first.company.as_deref(), Some("UBS AG"));
        assert_eq!(first.location.as_deref(), Some("Zürich"));
        assert_eq!(
            first.link.as_deref(),
            Some("https://www.jobs.ch/en/vacancies/detail/1/")
        );
        assert_eq!(first.duration.as_deref(), Some(DEFAULT_DURATION));
    }

    #[test]
    fn jobs_ch_falls_back_to_job_anchors() {
        let html = r#"
            <ul>
              <li><a href="/en/vacancies/job/9/">Graduate Programme Finance</a>
                  <span class="CompanyName">Swiss Re</span></li>
              <li><a href="/en/vacancies/job/10/">  </a></li>
              <li><a href="/en/about/">About us</a></li>
            </ul>
        "#;
        let results = JobsChExtractor.parse_listing_page(html, "https://www.jobs.ch/en/vacancies/?term=x");
        assert_eq!(results.len(), 2);
        let candidates = ok_candidates(results);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].company.as_deref(), Some("Swiss Re"));
        assert_eq!(candidates[0].location.as_deref(), Some(DEFAULT_LOCATION));
        assert_eq!(
            candidates[0].link.as_deref(),
            Some("https://www.jobs.ch/en/vacancies/job/9/")
        );
    }

    #[test]
    fn jobup_uses_placeholder_company_and_page_link() {
        let html = r#"
            <div class="job-card">
              <h3>Stage en contrôle de gestion</h3>
              <div class="location-label">Lausanne</div>
            </div>
        "#;
        let page = "https://www.jobup.ch/en/jobs/?term=stage";
        let candidates = ok_candidates(JobupChExtractor.parse_listing_page(html, page));
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].company.as_deref(), Some(UNKNOWN_COMPANY));
        assert_eq!(candidates[0].location.as_deref(), Some("Lausanne"));
        assert_eq!(candidates[0].link.as_deref(), Some(page));
    }

    #[test]
    fn travail_swiss_detects_legal_form_and_city() {
        let html = r#"
            <li class="listing-row">
              <h4><a href="/job/77">Stagiaire Finance &amp; Contrôle</a></h4>
              <p>Genève, temps plein</p>
              <span>Pictet &amp; Cie SA</span>
            </li>
            <li class="listing-row"><p>No heading here</p></li>
        "#;
        let results = TravailSwissExtractor.parse_listing_page(html, "https://www.travail.swiss/job-search/?keywords=x");
        assert_eq!(results.len(), 2);
        assert!(matches!(results[1], Err(ExtractionError::MissingTitle)));
        let candidates = ok_candidates(results);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].title.as_deref(), Some("Stagiaire Finance & Contrôle"));
        assert_eq!(candidates[0].company.as_deref(), Some("Pictet & Cie SA"));
        assert_eq!(candidates[0].location.as_deref(), Some("Genève, temps plein"));
        assert_eq!(candidates[0].link.as_deref(), Some("https://www.travail.swiss/job/77"));
    }

    #[test]
    fn efinancialcareers_skips_senior_roles() {
        let html = r#"
            <li class="search-result">
              <a class="job-title" href="https://www.efinancialcareers.ch/jobs-1">Graduate Analyst - Treasury</a>
              <span class="company">Julius Bär Group</span>
              <span class="location">Zurich</span>
            </li>
            <li class="search-result">
              <a class="job-title" href="/jobs-2">Head of Equity Research</a>
            </li>
        "#;
        let results = EFinancialCareersExtractor.parse_listing_page(html, "https://www.efinancialcareers.ch/jobs/search");
        assert_eq!(results.len(), 2);
        assert!(matches!(results[1], Err(ExtractionError::OffTopic(_))));
        let candidates = ok_candidates(results);
        assert_eq!(candidates[0].company.as_deref(), Some("Julius Bär Group"));
        assert_eq!(candidates[0].location.as_deref(), Some("Zurich"));
    }

    #[test]
    fn indeed_cards_take_link_from_title() {
        let html = r#"
            <div class="job_seen_beacon">
              <h2 class="jobTitle"><a href="/rc/clk?jk=abc">Praktikant Controlling (m/w/d)</a></h2>
              <span class="companyName">Roche</span>
              <div class="companyLocation">Basel</div>
            </div>
            <div class="job_seen_beacon"><h2 class="jobTitle">No Company Listed Here</h2></div>
        "#;
        let results = IndeedChExtractor.parse_listing_page(html, "https://ch.indeed.com/jobs?q=x");
        assert!(matches!(results[1], Err(ExtractionError::MissingCompany)));
        let candidates = ok_candidates(results);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].link.as_deref(), Some("https://ch.indeed.com/rc/clk?jk=abc"));
    }

    #[test]
    fn unparsable_markup_never_panics() {
        for extractor in all_extractors() {
            let results = extractor.parse_listing_page("<<<not html", "https://example.ch/");
            assert!(ok_candidates(results).is_empty());
        }
    }

    struct LoopbackExtractor;

    #[async_trait]
    impl SourceExtractor for LoopbackExtractor {
        fn source_id(&self) -> &'static str {
            "loopback"
        }

        fn display_name(&self) -> &'static str {
            "Loopback"
        }

        fn base_url(&self) -> &'static str {
            "http://127.0.0.1:1/"
        }

        fn search_url(&self, term: &str) -> String {
            format!("http://127.0.0.1:1/?q={}", term.replace(' ', "+"))
        }

        fn parse_listing_page(
            &self,
            _html: &str,
            _page_url: &str,
        ) -> Vec<Result<RawCandidate, ExtractionError>> {
            vec![Ok(RawCandidate {
                company: Some("UBS".to_string()),
                title: Some("Stage Finance".to_string()),
                ..RawCandidate::default()
            })]
        }
    }

    #[tokio::test]
    async fn unreachable_pages_are_counted_not_raised() {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(2),
            min_request_interval: Duration::ZERO,
            backoff: BackoffPolicy {
                max_retries: 0,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(1),
            },
            ..HttpClientConfig::default()
        })
        .expect("client");
        let terms = vec!["stage finance".to_string(), "internship".to_string()];

        let batch = LoopbackExtractor
            .extract(&http, &ExtractionContext::new(), &terms, DEFAULT_RESULTS_PER_PAGE)
            .await;

        assert_eq!(batch.source_id, "loopback");
        assert_eq!(batch.pages_failed, terms.len());
        assert!(batch.candidates.is_empty());
        assert!(batch.pages.is_empty());
        assert_eq!(batch.fragments_skipped, 0);
    }
}
