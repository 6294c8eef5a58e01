//! Listing query builder.
//!
//! Turns a validated filter/sort request plus the requesting user's
//! profile into a [`ListingQuery`]: a typed predicate tree, an ordering and
//! a result cap. Building is pure; the current time is an input, so equal
//! inputs always yield equal queries. [`ListingQuery::push_sql`] renders the
//! query onto a `sqlx::QueryBuilder` with every value bound.

use serde::{Deserialize, Serialize};
use sqlx::{QueryBuilder, Sqlite};

use crate::models::{ListingType, Skill, UserProfile};

/// Page size when the caller does not ask for one.
pub const DEFAULT_TAKE: i64 = 20;
/// Ceiling for the general listings feed.
pub const LISTINGS_MAX_TAKE: i64 = 100;
/// Ceiling for hackathon track listings, which are fetched in one go.
pub const HACKATHON_MAX_TAKE: i64 = 2000;

/// Region value of listings open to everyone.
pub const GLOBAL_REGION: &str = "Global";

// ─────────────────────────────────────────────────────────
// Request parameters
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tab {
    #[default]
    All,
    Bounties,
    Projects,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Category {
    #[default]
    All,
    #[serde(rename = "For You")]
    ForYou,
    Design,
    Content,
    Development,
    Other,
}

impl Category {
    /// Skill tags a listing needs (any of) to show up under this category.
    /// `None` means no skill restriction.
    pub fn skills(self) -> Option<&'static [Skill]> {
        match self {
            Self::All | Self::ForYou => None,
            Self::Design => Some(&[Skill::Design]),
            Self::Content => Some(&[Skill::Content]),
            Self::Development => Some(&[
                Skill::Frontend,
                Skill::Backend,
                Skill::Blockchain,
                Skill::Mobile,
            ]),
            Self::Other => Some(&[Skill::Other, Skill::Growth, Skill::Community]),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusFilter {
    #[default]
    Open,
    Review,
    Completed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortBy {
    #[default]
    Date,
    Prize,
    Submissions,
}

impl SortBy {
    fn default_order(self) -> SortOrder {
        match self {
            Self::Date => SortOrder::Asc,
            Self::Prize | Self::Submissions => SortOrder::Desc,
        }
    }
}

/// Which page is asking; narrows results to one region, sponsor or hackathon.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Context {
    #[default]
    All,
    Home,
    Region,
    Sponsor,
    Hackathon,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ListingParams {
    pub tab: Tab,
    pub order: Option<SortOrder>,
    pub category: Category,
    pub status: StatusFilter,
    pub sort_by: SortBy,
    pub context: Context,
    pub region: Option<String>,
    pub sponsor: Option<String>,
    pub hackathon: Option<String>,
    pub take: Option<i64>,
}

// ─────────────────────────────────────────────────────────
// Query shape
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum FlagColumn {
    IsPublished,
    IsActive,
    IsArchived,
    IsPrivate,
    IsWinnerAnnounced,
}

impl FlagColumn {
    fn column(self) -> &'static str {
        match self {
            Self::IsPublished => "l.is_published",
            Self::IsActive => "l.is_active",
            Self::IsArchived => "l.is_archived",
            Self::IsPrivate => "l.is_private",
            Self::IsWinnerAnnounced => "l.is_winner_announced",
        }
    }
}

/// Predicate over the `listings l` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "op", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Filter {
    And { clauses: Vec<Filter> },
    Flag { column: FlagColumn, value: bool },
    DeadlineAfter { at: i64 },
    DeadlineAtOrBefore { at: i64 },
    TypeIn { types: Vec<ListingType> },
    RegionIn { regions: Vec<String> },
    SponsorSlug { slug: String },
    HackathonSlug { slug: String },
    SkillsAny { skills: Vec<Skill> },
}

impl Filter {
    fn flag(column: FlagColumn, value: bool) -> Self {
        Self::Flag { column, value }
    }

    pub fn push_sql(&self, qb: &mut QueryBuilder<'_, Sqlite>) {
        match self {
            Self::And { clauses } if clauses.is_empty() => {
                qb.push("1 = 1");
            }
            Self::And { clauses } => {
                qb.push("(");
                for (i, clause) in clauses.iter().enumerate() {
                    if i > 0 {
                        qb.push(" AND ");
                    }
                    clause.push_sql(qb);
                }
                qb.push(")");
            }
            Self::Flag { column, value } => {
                qb.push(column.column()).push(" = ").push_bind(*value);
            }
            Self::DeadlineAfter { at } => {
                qb.push("l.deadline > ").push_bind(*at);
            }
            Self::DeadlineAtOrBefore { at } => {
                qb.push("l.deadline <= ").push_bind(*at);
            }
            Self::TypeIn { types } => {
                push_in_list(qb, "l.listing_type", types.iter().copied());
            }
            Self::RegionIn { regions } => {
                push_in_list(qb, "l.region", regions.iter().cloned());
            }
            Self::SponsorSlug { slug } => {
                qb.push("l.sponsor_id IN (SELECT id FROM sponsors WHERE slug = ")
                    .push_bind(slug.clone())
                    .push(")");
            }
            Self::HackathonSlug { slug } => {
                qb.push("l.hackathon_slug = ").push_bind(slug.clone());
            }
            Self::SkillsAny { skills } => {
                qb.push("l.id IN (SELECT listing_id FROM listing_skills WHERE ");
                push_in_list(qb, "skill", skills.iter().copied());
                qb.push(")");
            }
        }
    }
}

fn push_in_list<'args, T>(
    qb: &mut QueryBuilder<'args, Sqlite>,
    column: &str,
    values: impl ExactSizeIterator<Item = T>,
) where
    T: 'args + sqlx::Encode<'args, Sqlite> + sqlx::Type<Sqlite> + Send,
{
    if values.len() == 0 {
        qb.push("0 = 1");
        return;
    }
    qb.push(column).push(" IN (");
    let mut list = qb.separated(", ");
    for value in values {
        list.push_bind(value);
    }
    list.push_unseparated(")");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum OrderKey {
    Deadline,
    RewardAmount,
    SubmissionCount,
    Id,
}

impl OrderKey {
    fn expr(self) -> &'static str {
        match self {
            Self::Deadline => "l.deadline",
            // Range listings have no fixed reward; rank them by their ceiling.
            Self::RewardAmount => "COALESCE(l.reward_amount, l.max_reward_ask, 0)",
            Self::SubmissionCount => "submission_count",
            Self::Id => "l.id",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderBy {
    pub key: OrderKey,
    pub order: SortOrder,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListingQuery {
    pub filter: Filter,
    pub order_by: Vec<OrderBy>,
    pub take: i64,
}

impl ListingQuery {
    /// Append `<filter> ORDER BY ... LIMIT ?` to a query whose text so far
    /// ends in `WHERE `.
    pub fn push_sql(&self, qb: &mut QueryBuilder<'_, Sqlite>) {
        self.filter.push_sql(qb);
        qb.push(" ORDER BY ");
        for (i, order) in self.order_by.iter().enumerate() {
            if i > 0 {
                qb.push(", ");
            }
            qb.push(order.key.expr());
            qb.push(match order.order {
                SortOrder::Asc => " ASC",
                SortOrder::Desc => " DESC",
            });
        }
        qb.push(" LIMIT ").push_bind(self.take);
    }
}

// ─────────────────────────────────────────────────────────
// Builder
// ─────────────────────────────────────────────────────────

/// Build the listing query for `params` as seen by `user` at time `now`
/// (Unix seconds), capping the page size at `max_take`.
pub fn build_listing_query(
    params: &ListingParams,
    user: Option<&UserProfile>,
    now: i64,
    max_take: i64,
) -> ListingQuery {
    let mut clauses = vec![
        Filter::flag(FlagColumn::IsPublished, true),
        Filter::flag(FlagColumn::IsActive, true),
        Filter::flag(FlagColumn::IsArchived, false),
        Filter::flag(FlagColumn::IsPrivate, false),
    ];

    match (params.context, params.hackathon.as_ref()) {
        (Context::Hackathon, Some(slug)) => {
            clauses.push(Filter::TypeIn {
                types: vec![ListingType::Hackathon],
            });
            clauses.push(Filter::HackathonSlug { slug: slug.clone() });
        }
        _ => clauses.push(Filter::TypeIn {
            types: match params.tab {
                Tab::All => vec![ListingType::Bounty, ListingType::Project],
                Tab::Bounties => vec![ListingType::Bounty],
                Tab::Projects => vec![ListingType::Project],
            },
        }),
    }

    match params.context {
        Context::Region => {
            if let Some(region) = &params.region {
                clauses.push(Filter::RegionIn {
                    regions: vec![region.clone()],
                });
            }
        }
        Context::Sponsor => {
            if let Some(slug) = &params.sponsor {
                clauses.push(Filter::SponsorSlug { slug: slug.clone() });
            }
        }
        Context::All | Context::Home | Context::Hackathon => {}
    }

    if let Some(skills) = params.category.skills() {
        clauses.push(Filter::SkillsAny {
            skills: skills.to_vec(),
        });
    } else if params.category == Category::ForYou {
        clauses.extend(for_you_filters(user));
    }

    match params.status {
        StatusFilter::Open => {
            clauses.push(Filter::DeadlineAfter { at: now });
            clauses.push(Filter::flag(FlagColumn::IsWinnerAnnounced, false));
        }
        StatusFilter::Review => {
            clauses.push(Filter::DeadlineAtOrBefore { at: now });
            clauses.push(Filter::flag(FlagColumn::IsWinnerAnnounced, false));
        }
        StatusFilter::Completed => {
            clauses.push(Filter::flag(FlagColumn::IsWinnerAnnounced, true));
        }
    }

    let primary = match params.sort_by {
        SortBy::Date => OrderKey::Deadline,
        SortBy::Prize => OrderKey::RewardAmount,
        SortBy::Submissions => OrderKey::SubmissionCount,
    };
    let order_by = vec![
        OrderBy {
            key: primary,
            order: params.order.unwrap_or(params.sort_by.default_order()),
        },
        OrderBy {
            key: OrderKey::Id,
            order: SortOrder::Desc,
        },
    ];

    let take = params.take.unwrap_or(DEFAULT_TAKE).clamp(1, max_take.max(1));

    ListingQuery {
        filter: Filter::And { clauses },
        order_by,
        take,
    }
}

/// "For You" narrows to the user's skills and reachable regions, but only
/// for a user whose talent profile is filled in.
fn for_you_filters(user: Option<&UserProfile>) -> Vec<Filter> {
    let Some(user) = user.filter(|u| u.is_talent_filled && !u.skills.is_empty()) else {
        return Vec::new();
    };

    let mut regions = vec![GLOBAL_REGION.to_string()];
    if let Some(region) = user.region.as_ref().filter(|r| r.as_str() != GLOBAL_REGION) {
        regions.push(region.clone());
    }

    vec![
        Filter::SkillsAny {
            skills: user.skills.iter().copied().collect(),
        },
        Filter::RegionIn { regions },
    ]
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::db::{self, fixtures::*};

    const NOW: i64 = 1_717_200_000;

    fn talent(skills: &[Skill], region: Option<&str>) -> UserProfile {
        UserProfile {
            id: 7,
            region: region.map(String::from),
            skills: skills.iter().copied().collect::<BTreeSet<_>>(),
            is_talent_filled: true,
        }
    }

    fn clauses(query: &ListingQuery) -> &[Filter] {
        match &query.filter {
            Filter::And { clauses } => clauses,
            other => panic!("unexpected root filter {other:?}"),
        }
    }

    #[test]
    fn identical_inputs_give_identical_queries() {
        let params = ListingParams {
            category: Category::ForYou,
            sort_by: SortBy::Prize,
            ..Default::default()
        };
        let user = talent(&[Skill::Mobile, Skill::Backend], Some("Vietnam"));

        let a = build_listing_query(&params, Some(&user), NOW, LISTINGS_MAX_TAKE);
        let b = build_listing_query(&params, Some(&user), NOW, LISTINGS_MAX_TAKE);
        assert_eq!(
            serde_json::to_vec(&a).unwrap(),
            serde_json::to_vec(&b).unwrap()
        );
    }

    #[test]
    fn category_maps_to_skill_allow_list() {
        let params = ListingParams {
            category: Category::Development,
            ..Default::default()
        };
        let query = build_listing_query(&params, None, NOW, LISTINGS_MAX_TAKE);
        assert!(clauses(&query).contains(&Filter::SkillsAny {
            skills: vec![
                Skill::Frontend,
                Skill::Backend,
                Skill::Blockchain,
                Skill::Mobile
            ]
        }));
    }

    #[test]
    fn for_you_uses_profile_or_falls_back() {
        let params = ListingParams {
            category: Category::ForYou,
            ..Default::default()
        };
        let user = talent(&[Skill::Design], Some("India"));
        let query = build_listing_query(&params, Some(&user), NOW, LISTINGS_MAX_TAKE);
        assert!(clauses(&query).contains(&Filter::SkillsAny {
            skills: vec![Skill::Design]
        }));
        assert!(clauses(&query).contains(&Filter::RegionIn {
            regions: vec!["Global".into(), "India".into()]
        }));

        let anonymous = build_listing_query(&params, None, NOW, LISTINGS_MAX_TAKE);
        let unfilled = UserProfile {
            is_talent_filled: false,
            ..user
        };
        let incomplete = build_listing_query(&params, Some(&unfilled), NOW, LISTINGS_MAX_TAKE);
        for query in [anonymous, incomplete] {
            assert!(!clauses(&query)
                .iter()
                .any(|c| matches!(c, Filter::SkillsAny { .. } | Filter::RegionIn { .. })));
        }
    }

    #[test]
    fn status_maps_to_deadline_and_announcement() {
        let query = |status| {
            build_listing_query(
                &ListingParams {
                    status,
                    ..Default::default()
                },
                None,
                NOW,
                LISTINGS_MAX_TAKE,
            )
        };

        let open = query(StatusFilter::Open);
        assert!(clauses(&open).contains(&Filter::DeadlineAfter { at: NOW }));
        assert!(clauses(&open).contains(&Filter::flag(FlagColumn::IsWinnerAnnounced, false)));

        let review = query(StatusFilter::Review);
        assert!(clauses(&review).contains(&Filter::DeadlineAtOrBefore { at: NOW }));

        let completed = query(StatusFilter::Completed);
        assert!(clauses(&completed).contains(&Filter::flag(FlagColumn::IsWinnerAnnounced, true)));
        assert!(!clauses(&completed)
            .iter()
            .any(|c| matches!(c, Filter::DeadlineAfter { .. } | Filter::DeadlineAtOrBefore { .. })));
    }

    #[test]
    fn sort_has_id_tiebreak() {
        let query = build_listing_query(
            &ListingParams {
                sort_by: SortBy::Submissions,
                ..Default::default()
            },
            None,
            NOW,
            LISTINGS_MAX_TAKE,
        );
        assert_eq!(
            query.order_by,
            vec![
                OrderBy {
                    key: OrderKey::SubmissionCount,
                    order: SortOrder::Desc
                },
                OrderBy {
                    key: OrderKey::Id,
                    order: SortOrder::Desc
                },
            ]
        );

        let date = build_listing_query(&ListingParams::default(), None, NOW, LISTINGS_MAX_TAKE);
        assert_eq!(date.order_by[0].order, SortOrder::Asc);
    }

    #[test]
    fn take_is_capped() {
        let take = |requested, max| {
            build_listing_query(
                &ListingParams {
                    take: requested,
                    ..Default::default()
                },
                None,
                NOW,
                max,
            )
            .take
        };
        assert_eq!(take(None, LISTINGS_MAX_TAKE), DEFAULT_TAKE);
        assert_eq!(take(Some(5000), LISTINGS_MAX_TAKE), 100);
        assert_eq!(take(Some(5000), HACKATHON_MAX_TAKE), 2000);
        assert_eq!(take(Some(-3), LISTINGS_MAX_TAKE), 1);
    }

    #[test]
    fn params_parse_from_query_string() {
        let params: ListingParams = serde_json::from_value(serde_json::json!({
            "tab": "bounties",
            "order": "desc",
            "category": "For You",
            "status": "review",
            "sortBy": "Prize",
            "context": "region",
            "region": "Germany",
        }))
        .unwrap();
        assert_eq!(params.tab, Tab::Bounties);
        assert_eq!(params.category, Category::ForYou);
        assert_eq!(params.sort_by, SortBy::Prize);
        assert_eq!(params.region.as_deref(), Some("Germany"));
        assert!(serde_json::from_value::<ListingParams>(serde_json::json!({"status": "later"})).is_err());
    }

    #[tokio::test]
    async fn rendered_query_runs_against_sqlite() {
        let pool = memory_pool().await;
        let sponsor = insert_sponsor(&pool, "acme").await;
        let other_sponsor = insert_sponsor(&pool, "other").await;

        let dev = insert_listing(
            &pool,
            NewListing {
                reward_amount: Some(500),
                skills: &[Skill::Backend],
                ..NewListing::bounty(sponsor, "dev", NOW + 100)
            },
        )
        .await;
        let design = insert_listing(
            &pool,
            NewListing {
                reward_amount: Some(3000),
                skills: &[Skill::Design],
                ..NewListing::bounty(sponsor, "design", NOW + 200)
            },
        )
        .await;
        let ranged = insert_listing(
            &pool,
            NewListing {
                compensation_type: crate::models::CompensationType::Range,
                reward_amount: None,
                max_reward_ask: Some(2000),
                skills: &[Skill::Frontend],
                ..NewListing::bounty(other_sponsor, "ranged", NOW + 300)
            },
        )
        .await;
        // Never visible in the open feed.
        insert_listing(&pool, NewListing::bounty(sponsor, "expired", NOW - 10)).await;
        insert_listing(
            &pool,
            NewListing {
                is_private: true,
                ..NewListing::bounty(sponsor, "private", NOW + 50)
            },
        )
        .await;
        insert_listing(
            &pool,
            NewListing {
                is_published: false,
                ..NewListing::bounty(sponsor, "draft", NOW + 50)
            },
        )
        .await;

        let ids = |rows: Vec<crate::models::ListingRecord>| rows.iter().map(|l| l.id).collect::<Vec<_>>();

        let by_date = build_listing_query(&ListingParams::default(), None, NOW, LISTINGS_MAX_TAKE);
        let rows = db::fetch_listings(&pool, &by_date).await.unwrap();
        assert_eq!(ids(rows), vec![dev, design, ranged]);

        let by_prize = build_listing_query(
            &ListingParams {
                sort_by: SortBy::Prize,
                ..Default::default()
            },
            None,
            NOW,
            LISTINGS_MAX_TAKE,
        );
        let rows = db::fetch_listings(&pool, &by_prize).await.unwrap();
        assert_eq!(ids(rows), vec![design, ranged, dev]);

        let development = build_listing_query(
            &ListingParams {
                category: Category::Development,
                ..Default::default()
            },
            None,
            NOW,
            LISTINGS_MAX_TAKE,
        );
        let rows = db::fetch_listings(&pool, &development).await.unwrap();
        assert_eq!(ids(rows), vec![dev, ranged]);

        let sponsor_page = build_listing_query(
            &ListingParams {
                context: Context::Sponsor,
                sponsor: Some("other".into()),
                ..Default::default()
            },
            None,
            NOW,
            LISTINGS_MAX_TAKE,
        );
        let rows = db::fetch_listings(&pool, &sponsor_page).await.unwrap();
        assert_eq!(ids(rows), vec![ranged]);

        let one = build_listing_query(
            &ListingParams {
                take: Some(1),
                ..Default::default()
            },
            None,
            NOW,
            LISTINGS_MAX_TAKE,
        );
        let rows = db::fetch_listings(&pool, &one).await.unwrap();
        assert_eq!(ids(rows), vec![dev]);
    }
}
