use std::cmp::Reverse;
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::classify::Flow;
use crate::feed::{group_items, GroupKey, OperationItem};
use crate::model::RecordKind;

pub const DEFAULT_PAGE_SIZE: usize = 50;
pub const MAX_PAGE_SIZE: usize = 200;

/// Query parameters exactly as they arrive from a query string.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RawFeedParams {
    pub page: Option<String>,
    pub page_size: Option<String>,
    pub kind: Option<String>,
    pub q: Option<String>,
    pub warn: Option<String>,
    pub flow: Option<String>,
    pub integrated: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IntegrationFilter {
    Integrated,
    Standalone,
}

/// Normalized feed query. Every field has a safe default; nothing here is ever rejected.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FeedQuery {
    pub page: usize,
    pub page_size: usize,
    pub kind: Option<RecordKind>,
    pub text: Option<String>,
    pub warn_only: bool,
    pub flow: Option<Flow>,
    pub integration: Option<IntegrationFilter>,
}

impl Default for FeedQuery {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: DEFAULT_PAGE_SIZE,
            kind: None,
            text: None,
            warn_only: false,
            flow: None,
            integration: None,
        }
    }
}

impl FeedQuery {
    #[must_use]
    pub fn from_params(params: &RawFeedParams) -> Self {
        let page = parse_int(params.page.as_deref())
            .map_or(1, |page| usize::try_from(page.max(1)).unwrap_or(usize::MAX));
        let page_size = parse_int(params.page_size.as_deref()).map_or(DEFAULT_PAGE_SIZE, |size| {
            usize::try_from(size.max(1)).unwrap_or(MAX_PAGE_SIZE).min(MAX_PAGE_SIZE)
        });

        let kind = params.kind.as_deref().map(str::trim).and_then(RecordKind::parse);
        let text = params
            .q
            .as_deref()
            .map(|q| q.trim().to_lowercase())
            .filter(|q| !q.is_empty());
        let warn_only = params.warn.as_deref().map(str::trim) == Some("1");
        let flow = parse_int(params.flow.as_deref())
            .and_then(|code| u8::try_from(code).ok())
            .and_then(Flow::from_code);
        let integration = match params.integrated.as_deref().map(str::trim) {
            Some("1") => Some(IntegrationFilter::Integrated),
            Some("0") => Some(IntegrationFilter::Standalone),
            _ => None,
        };

        Self {
            page,
            page_size,
            kind,
            text,
            warn_only,
            flow,
            integration,
        }
    }
}

fn parse_int(value: Option<&str>) -> Option<i64> {
    value.and_then(|value| value.trim().parse::<i64>().ok())
}

/// One page of the feed plus the post-filter, pre-pagination count.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FeedPage {
    pub items: Vec<OperationItem>,
    pub total: usize,
}

/// Sort, filter and paginate the unified feed.
#[must_use]
pub fn run_query(mut items: Vec<OperationItem>, query: &FeedQuery) -> FeedPage {
    // Newest first; undated items sink to the end. The sort is stable.
    items.sort_by_key(|item| (item.created_at.is_none(), Reverse(item.created_at)));

    if let Some(kind) = query.kind {
        items.retain(|item| item.kind == kind);
    }

    if let Some(text) = &query.text {
        items.retain(|item| matches_text(item, text));
    }

    if let Some(flow) = query.flow {
        let keys = matching_groups(&items, |item| item.flow == flow);
        items.retain(|item| keys.contains(&item.group_key));
    }

    if let Some(filter) = query.integration {
        let integrated = matching_groups(&items, |item| item.is_integrated);
        items.retain(|item| {
            let is_integrated = integrated.contains(&item.group_key);
            match filter {
                IntegrationFilter::Integrated => is_integrated,
                IntegrationFilter::Standalone => !is_integrated,
            }
        });
    }

    if query.warn_only {
        items = warned_groups(&items);
    }

    let total = items.len();
    let offset = query.page.saturating_sub(1).saturating_mul(query.page_size);
    let items = items.into_iter().skip(offset).take(query.page_size).collect();
    FeedPage { items, total }
}

fn matches_text(item: &OperationItem, text: &str) -> bool {
    let haystacks = [
        Some(item.id.as_str()),
        item.customer.name.as_deref(),
        item.customer.email.as_deref(),
        Some(item.title.as_str()),
    ];
    haystacks.into_iter().flatten().any(|field| field.to_lowercase().contains(text))
}

fn matching_groups(items: &[OperationItem], predicate: impl Fn(&OperationItem) -> bool) -> BTreeSet<GroupKey> {
    items.iter().filter(|item| predicate(item)).map(|item| item.group_key.clone()).collect()
}

fn warned_groups(items: &[OperationItem]) -> Vec<OperationItem> {
    let mut groups = group_items(items)
        .into_iter()
        .filter(|group| group.is_warned())
        .collect::<Vec<_>>();
    groups.sort_by_key(|group| (group.latest().is_none(), Reverse(group.latest())));
    groups
        .iter()
        .flat_map(|group| group.flattened().into_iter().cloned())
        .collect()
}
