//! Extraction of channel records from tgstat rating pages.
//!
//! One rating page is a flat list of channel cards. Extraction is tolerant:
//! a malformed card never aborts the page, missing optional fields default
//! to zero/empty, and only a card without a channel link (no identity) is
//! skipped entirely.

use scraper::{ElementRef, Html, Selector};
use tgrank_core::{ChannelDraft, SourceKind};
use tgrank_storage::{FetchError, FetchedPage, HttpFetcher};
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "tgrank-extract";

// Label texts as they appear on the cards; the nearest preceding <h4>
// sibling of the label div carries the value.
const SUBSCRIBERS_LABEL: &str = "подписчиков";
const CITATION_LABEL: &str = "индекс цитирования";

/// One of the two fixed rating endpoints, differentiated by the `sort`
/// query parameter.
#[derive(Debug, Clone)]
pub struct RatingSource {
    pub kind: SourceKind,
    pub url: String,
}

impl RatingSource {
    pub fn new(kind: SourceKind, url: impl Into<String>) -> Self {
        Self {
            kind,
            url: url.into(),
        }
    }

    pub async fn fetch(
        &self,
        http: &HttpFetcher,
        run_id: Uuid,
    ) -> Result<FetchedPage, FetchError> {
        http.fetch_page(run_id, self.kind.id(), &self.url).await
    }
}

struct CardSelectors {
    card: Selector,
    channel_link: Selector,
    image: Selector,
    name: Selector,
    category: Selector,
    ribbon: Selector,
    div: Selector,
}

impl CardSelectors {
    fn new() -> Self {
        Self {
            card: Selector::parse("div.peer-item-row").expect("valid selector"),
            channel_link: Selector::parse(r#"a[href*="/channel/"]"#).expect("valid selector"),
            image: Selector::parse("img").expect("valid selector"),
            name: Selector::parse("div.font-16").expect("valid selector"),
            category: Selector::parse("div.text-truncate.font-12 > span").expect("valid selector"),
            ribbon: Selector::parse("div.ribbon").expect("valid selector"),
            div: Selector::parse("div").expect("valid selector"),
        }
    }
}

/// Parse one rating page into channel drafts. Never fails: unusable cards
/// are skipped, missing optional fields default.
pub fn parse_rating_page(markup: &str) -> Vec<ChannelDraft> {
    let selectors = CardSelectors::new();
    let document = Html::parse_document(markup);

    let mut drafts = Vec::new();
    for card in document.select(&selectors.card) {
        let Some(url) = card
            .select(&selectors.channel_link)
            .next()
            .and_then(|a| a.value().attr("href"))
            .map(str::to_string)
        else {
            debug!("skipping card without channel link");
            continue;
        };

        let image = card
            .select(&selectors.image)
            .next()
            .and_then(|img| img.value().attr("src"))
            .map(absolutize_image_url)
            .unwrap_or_default();

        let name = card
            .select(&selectors.name)
            .next()
            .map(|n| n.text().collect::<String>().trim().to_string())
            .unwrap_or_default();

        let category = card
            .select(&selectors.category)
            .next()
            .map(|n| n.text().collect::<String>().trim().to_string())
            .unwrap_or_default();

        let rank = card
            .select(&selectors.ribbon)
            .next()
            .map(|n| parse_count(n.text().collect::<String>().trim_start_matches('#')))
            .unwrap_or(0);

        let subscribers = labeled_h4_value(card, &selectors.div, SUBSCRIBERS_LABEL)
            .map(|text| parse_count(&text))
            .unwrap_or(0);

        let ci = labeled_h4_value(card, &selectors.div, CITATION_LABEL)
            .map(|text| parse_count(&text))
            .unwrap_or(0);

        drafts.push(ChannelDraft {
            url,
            name,
            subscribers,
            category,
            image,
            rank,
            ci,
        });
    }
    drafts
}

/// Finds the div whose own text carries `label` and returns the text of its
/// nearest preceding `<h4>` sibling.
fn labeled_h4_value(card: ElementRef, div: &Selector, label: &str) -> Option<String> {
    for candidate in card.select(div) {
        let own_text: String = candidate
            .children()
            .filter_map(|node| node.value().as_text().map(|t| t.to_string()))
            .collect();
        if !own_text.contains(label) {
            continue;
        }
        for sibling in candidate.prev_siblings() {
            if let Some(el) = ElementRef::wrap(sibling) {
                if el.value().name() == "h4" {
                    return Some(el.text().collect::<String>());
                }
            }
        }
    }
    None
}

/// Parses subscriber/citation counts the way the cards format them: spaces
/// (including NBSP) as thousands separators, a trailing `k` expanded to
/// thousands, anything after the leading digits ignored.
fn parse_count(text: &str) -> u64 {
    let cleaned = text
        .trim()
        .replace('\u{a0}', "")
        .replace(' ', "")
        .replace(['k', 'K'], "000");
    let digits: String = cleaned.chars().take_while(char::is_ascii_digit).collect();
    digits.parse().unwrap_or(0)
}

fn absolutize_image_url(src: &str) -> String {
    if src.starts_with("http") {
        src.to_string()
    } else {
        format!("https:{src}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn card(url: &str, name: &str, subs: &str, ci: Option<&str>, rank: Option<&str>) -> String {
        let ribbon = rank
            .map(|r| format!(r#"<div class="ribbon">#{r}</div>"#))
            .unwrap_or_default();
        let citation = ci
            .map(|v| format!(r#"<h4>{v}</h4><div>индекс цитирования</div>"#))
            .unwrap_or_default();
        format!(
            r#"<div class="peer-item-row">
                 {ribbon}
                 <a href="{url}"><img src="//cdn.example/avatar.jpg"></a>
                 <div class="font-16">{name}</div>
                 <div class="text-truncate font-12"><span>Новости</span></div>
                 <h4>{subs}</h4><div>подписчиков</div>
                 {citation}
               </div>"#
        )
    }

    #[test]
    fn parses_full_card() {
        let html = card(
            "https://tgstat.ru/channel/@news",
            "Daily News",
            "1 250 000",
            Some("420"),
            Some("7"),
        );
        let drafts = parse_rating_page(&html);
        assert_eq!(drafts.len(), 1);
        let d = &drafts[0];
        assert_eq!(d.url, "https://tgstat.ru/channel/@news");
        assert_eq!(d.name, "Daily News");
        assert_eq!(d.subscribers, 1_250_000);
        assert_eq!(d.ci, 420);
        assert_eq!(d.rank, 7);
        assert_eq!(d.category, "Новости");
        assert_eq!(d.image, "https://cdn.example/avatar.jpg");
    }

    #[test]
    fn trailing_k_expands_to_thousands() {
        assert_eq!(parse_count("120k"), 120_000);
        assert_eq!(parse_count("1 250"), 1250);
        assert_eq!(parse_count("#12"), 0);
        assert_eq!(parse_count("12"), 12);
    }

    #[test]
    fn optional_fields_default_instead_of_failing() {
        let html = card("https://tgstat.ru/channel/@bare", "Bare", "500", None, None);
        let drafts = parse_rating_page(&html);
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].ci, 0);
        assert_eq!(drafts[0].rank, 0);
    }

    #[test]
    fn card_without_channel_link_is_skipped() {
        let html = r#"<div class="peer-item-row"><div class="font-16">Orphan</div></div>"#;
        assert!(parse_rating_page(html).is_empty());
    }

    #[test]
    fn absolute_image_urls_are_left_alone() {
        assert_eq!(
            absolutize_image_url("https://cdn.example/x.jpg"),
            "https://cdn.example/x.jpg"
        );
        assert_eq!(
            absolutize_image_url("//cdn.example/x.jpg"),
            "https://cdn.example/x.jpg"
        );
    }

    #[test]
    fn malformed_markup_yields_empty_not_error() {
        assert!(parse_rating_page("<<<not html>>>").is_empty());
        assert!(parse_rating_page("").is_empty());
    }

    #[test]
    fn multiple_cards_keep_page_order() {
        let html = format!(
            "{}{}",
            card("https://tgstat.ru/channel/@a", "A", "100", None, Some("1")),
            card("https://tgstat.ru/channel/@b", "B", "200", None, Some("2")),
        );
        let drafts = parse_rating_page(&html);
        assert_eq!(drafts.len(), 2);
        assert_eq!(drafts[0].url, "https://tgstat.ru/channel/@a");
        assert_eq!(drafts[1].url, "https://tgstat.ru/channel/@b");
    }
}
