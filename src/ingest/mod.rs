//! Translates captured API responses into store mutations.
//!
//! Each response is routed by the suffix of its URL path; handlers extract
//! endpoint variables from the request (query parameters, cookies) and feed
//! the envelope walker. The observer, whose session produced the capture,
//! comes from the `twid` cookie.

pub mod envelope;
mod notifications;

use std::collections::{HashMap, HashSet};

use percent_encoding::percent_decode_str;
use serde_json::Value;
use spdlog::prelude::*;
use url::Url;

use crate::blob::{Blob, BlobKind};
use crate::error::{Error, Result};
use crate::ingest::envelope::Walker;
use crate::seqalign::Snapshot;
use crate::store::{IngestCtx, Store, UserId};

/// Request-side context of one captured response.
#[derive(Clone, Debug, Default)]
pub struct CaptureContext {
    pub url: String,
    pub time_ms: Option<i64>,
    pub cookies: Vec<(String, String)>,
}

impl CaptureContext {
    /// The logged-in user id, carried percent-encoded in the `twid` cookie
    /// as `u=<id>`.
    pub fn observer(&self) -> Option<UserId> {
        let raw = self
            .cookies
            .iter()
            .find_map(|(name, value)| (name == "twid").then_some(value.as_str()))?;
        let decoded = percent_decode_str(raw).decode_utf8().ok()?;
        decoded.strip_prefix("u=")?.parse().ok()
    }

    fn query(&self) -> HashMap<String, String> {
        Url::parse(&self.url)
            .map(|url| {
                url.query_pairs()
                    .map(|(k, v)| (k.into_owned(), v.into_owned()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// GraphQL requests carry their variables as a JSON-encoded query
    /// parameter.
    fn gql_vars(&self) -> Value {
        self.query()
            .get("variables")
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or(Value::Null)
    }
}

// Endpoints whose bodies are not plain JSON.
const NOT_JSON_PATHS: &[&str] = &[
    "/1.1/account/multi/list.json",
    "/1.1/account/multi/switch.json",
    "/1.1/account/settings.json",
    "/1.1/help/settings.json",
    "/live_pipeline/events",
];

// Plumbing endpoints with nothing worth keeping.
const UNINTERESTING_PREFIXES: &[&str] = &[
    "/1.1/live_pipeline/update_subscriptions",
    "/i/api/1.1/jot/",
    "/i/api/2/badge_count/badge_count.json",
    "/i/api/fleets/",
];

// GraphQL endpoints that are recognized but carry nothing for the store.
const IGNORED_ENDPOINTS: &[&str] = &[
    "GetUserClaims",
    "DataSaverMode",
    "CommunitiesTabBarItemQuery",
    "DMPinnedInboxQuery",
    "ProfileSpotlightsQuery",
    "getAltTextPromptPreference",
    "FetchDraftTweets",
    "FetchScheduledTweets",
    "AuthenticatedUserTFLists",
    "CheckTweetForNudge",
    "FavoriteTweet",
    "UnfavoriteTweet",
    "AudioSpaceById",
    "CreateRetweet",
    "FollowersYouKnow",
    "BlueVerifiedFollowers",
    "CreateBookmark",
    "articleNudgeDomains",
    "useFetchProfileBlocks_profileExistsQuery",
    "PinnedTimelines",
    "ExploreSidebar",
    "ExplorePage",
    "UserPreferences",
    "useTypingNotifierMutation",
    "AccountSwitcherDelegateQuery",
    "DelegatedAccountListQuery",
    "SensitiveMediaSettingsQuery",
    "fetchDownloadSettingAllowedQuery",
    "ListsManagementPageTimeline",
    "ListLatestTweetsTimeline",
    "BroadcastQuery",
    "PutClientEducationFlag",
    "ConnectTabTimeline",
    "TweetResultByRestId",
    "ModeratedTimeline",
    "PremiumSignUpQuery",
    "useSubscriptionProductDetailsQuery",
    "ListProductSubscriptions",
    "CommunitiesCreateButtonQuery",
    "CarouselQuery",
    "CommunitiesMainPageTimeline",
    "RemoveFollower",
    "ListOwnerships",
    "ListAddMember",
    "DeleteTweet",
    "ConversationControlChange",
    "DeleteRetweet",
    "PinTweet",
    "UnpinTweet",
    "useDMReactionMutationAddMutation",
    "DeleteBookmark",
    "CommunitiesFetchOneQuery",
    "BlueVerifiedProfileEditCalloutQuery",
    "ReportDetailQuery",
    "BirdwatchFetchAuthenticatedUserProfile",
    "BirdwatchFetchOneNote",
    "BirdwatchFetchAliasSelfSelectStatus",
    "BirdwatchFetchNotes",
    "usePricesQuery",
    "useVerifiedOrgFeatureHelperQuery",
    "useProductSkuQuery",
    "TranslationFeedbackProvideFeedbackMutation",
    "UserHighlightsTweets",
    "UserAccountLabel",
    "GenericTimelineById",
    "BookmarkSearchTimeline",
    "useRelayDelegateDataPendingQuery",
    "TrendRelevantUsers",
    "AiTrendByRestId",
    "FollowHostButtonQuery",
    "useFetchAnalyticsQuery",
    "AuthenticatePeriscope",
    "QuickPromoteEligibility",
    "TweetActivityQuery",
    "PremiumContentQuery",
    "SubscriptionProductDetails",
    "useFetchProfileSections_profileQuery",
    "useFetchProfileSections_canViewExpandedProfileQuery",
    "GrokHome",
    "GrokHistory",
    "GrokConversationItemsByRestId",
    "CreateGrokConversation",
    "GetGrokCustomizationSettingQuery",
    "Viewer",
    "ViewerUserQuery",
    "affiliatesQuery",
    "BenefitsBadgeCardQuery",
    "SupportedLanguages",
    "feedbackMutation",
    "personalityHooksAllPersonalitiesQuery",
    "TopicCarouselQuery",
    "CommunitiesRankedTimeline",
    "CommunitiesExploreTimeline",
    "isEligibleForVoButtonUpsellQuery",
    "isEligibleForAnalyticsUpsellQuery",
    "SidebarUserRecommendations",
    "NotificationsTimeline",
];

pub struct Dispatcher<'a> {
    pub store: &'a mut Store,
    pub strict: bool,
    pub ignore_urls: &'a HashSet<String>,
}

impl<'a> Dispatcher<'a> {
    pub fn new(store: &'a mut Store, strict: bool, ignore_urls: &'a HashSet<String>) -> Self {
        Dispatcher {
            store,
            strict,
            ignore_urls,
        }
    }

    fn schema(&self, msg: impl Into<String>) -> Result<()> {
        let msg = msg.into();
        if self.strict {
            return Err(Error::Schema(msg));
        }
        warn!("schema deviation: {msg}");
        Ok(())
    }

    /// Routes one captured response. `source` names the input file for log
    /// lines only.
    pub fn load_api(&mut self, source: &str, blob: &Blob, ctx: &CaptureContext) -> Result<()> {
        if self.ignore_urls.contains(&ctx.url) {
            return Ok(());
        }
        let path = Url::parse(&ctx.url)
            .map(|url| url.path().to_owned())
            .unwrap_or_default();

        if NOT_JSON_PATHS.contains(&path.as_str())
            || UNINTERESTING_PREFIXES
                .iter()
                .any(|prefix| path.starts_with(prefix))
        {
            return Ok(());
        }

        if ctx.url.starts_with("https://pbs.twimg.com/")
            || ctx.url.starts_with("https://video.twimg.com/")
        {
            if let BlobKind::InMemory { data } = &blob.kind {
                if data.is_empty() {
                    debug!("empty    {source} {path}");
                    return Ok(());
                }
            }
            debug!("media    {source} {path}");
            if let Err(err) = self.store.media.add_http_snapshot(&ctx.url, blob.clone()) {
                warn!("{err}");
            }
            return Ok(());
        }

        let data: Value = match serde_json::from_slice(&blob.read()?) {
            Ok(data) => data,
            Err(_) => {
                debug!("not json {source} {path}");
                return Ok(());
            }
        };

        if ctx.url.starts_with("https://twitter.com/i/api/graphql/")
            || ctx.url.starts_with("https://x.com/i/api/graphql/")
        {
            debug!("adding   {source} {path}");
            self.load_gql(&path, &data, ctx)
        } else if path == "/i/api/2/notifications/all.json" {
            self.load_notifications(&data, ctx)
        } else {
            debug!("skipping {source} {path}");
            Ok(())
        }
    }

    fn ingest_ctx(&mut self, ctx: &CaptureContext) -> IngestCtx {
        let observer = ctx.observer();
        if let Some(observer) = observer {
            self.store.observers.insert(observer);
        }
        IngestCtx {
            time_ms: ctx.time_ms,
            observer,
        }
    }

    fn load_notifications(&mut self, data: &Value, ctx: &CaptureContext) -> Result<()> {
        let ictx = self.ingest_ctx(ctx);
        notifications::load(self, &ictx, data)
    }

    /// Endpoint table; the suffix of the request path names the envelope.
    fn load_gql(&mut self, path: &str, data: &Value, ctx: &CaptureContext) -> Result<()> {
        let ictx = self.ingest_ctx(ctx);
        let Some(data) = data.get("data") else {
            return Ok(());
        };
        let endpoint = path.rsplit('/').next().unwrap_or_default();
        if IGNORED_ENDPOINTS.contains(&endpoint) {
            return Ok(());
        }

        match endpoint {
            "UserByRestId" | "UserByScreenName" => {
                if let Some(result) = data.pointer("/user/result") {
                    self.walker(ictx).add_user_result(result)?;
                } else if data.as_object().is_none_or(|map| !map.is_empty()) {
                    self.schema(format!("{endpoint} without a user result"))?;
                }
            }
            "UsersByRestIds" => {
                for user in data.pointer("/users").and_then(Value::as_array).into_iter().flatten() {
                    if let Some(result) = user.get("result") {
                        self.walker(ictx).add_user_result(result)?;
                    }
                }
            }
            "UsersVerifiedAvatars" => {
                for result in data
                    .pointer("/usersResults")
                    .and_then(Value::as_array)
                    .into_iter()
                    .flatten()
                {
                    if let Some(result) = result.get("result") {
                        self.walker(ictx).add_user_result(result)?;
                    }
                }
            }
            "HomeTimeline" | "HomeLatestTimeline" => {
                if let Some(timeline) = data.pointer("/home/home_timeline_urt") {
                    self.walker(ictx).walk_timeline(timeline)?;
                }
            }
            "TweetDetail" => {
                if let Some(timeline) = data.get("threaded_conversation_with_injections_v2") {
                    self.walker(ictx).walk_timeline(timeline)?;
                }
            }
            "UserTweets" | "UserTweetsAndReplies" | "UserMedia" => {
                if let Some(timeline) = self.user_timeline(ictx, data)? {
                    self.walker(ictx).walk_timeline(&timeline)?;
                }
            }
            "Likes" => {
                let Some(whose) = self.gql_user_id(ctx) else {
                    self.schema("like timeline without a userId variable")?;
                    return Ok(());
                };
                let Some(timeline) = self.user_timeline(ictx, data)? else {
                    return Ok(());
                };
                let out = self.walker(ictx).walk_timeline(&timeline)?;
                let likes: Vec<(i64, i64)> = out
                    .layout
                    .iter()
                    // tombstoned posts and locked accounts leave empty slots
                    .filter_map(|slot| slot.id.map(|id| (slot.sort_index, id)))
                    .collect();
                if likes.is_empty() {
                    return Ok(());
                }
                let time = ctx.time_ms.unwrap_or_default();
                // consecutive sort indexes mean positions; gaps mean like ids
                let snapshot = if likes.len() > 1 && likes[0].0 != likes[1].0 + 1 {
                    Snapshot::Events { seq: likes, time }
                } else {
                    Snapshot::Items {
                        items: likes.into_iter().map(|(_, id)| id).collect(),
                        time,
                    }
                };
                self.store.add_likes_snapshot(whose, snapshot);
            }
            "Bookmarks" => {
                let Some(observer) = ctx.observer() else {
                    self.schema("bookmark timeline without a session cookie")?;
                    return Ok(());
                };
                if let Some(timeline) = data.pointer("/bookmark_timeline_v2/timeline") {
                    let out = self.walker(ictx).walk_timeline(timeline)?;
                    for slot in &out.layout {
                        if let Some(id) = slot.id {
                            self.store.add_bookmark(observer, id, slot.sort_index);
                        }
                    }
                }
            }
            "Following" | "Followers" => {
                let Some(whose) = self.gql_user_id(ctx) else {
                    self.schema("follow roll without a userId variable")?;
                    return Ok(());
                };
                if let Some(timeline) = self.user_timeline(ictx, data)? {
                    let out = self.walker(ictx).walk_timeline(&timeline)?;
                    for slot in &out.layout {
                        if let Some(uid) = slot.id {
                            if endpoint == "Following" {
                                self.store.add_follow(whose, uid);
                            } else {
                                self.store.add_follow(uid, whose);
                            }
                        }
                    }
                }
            }
            "Favoriters" => {
                if let Some(timeline) = data.pointer("/favoriters_timeline/timeline") {
                    self.walker(ictx).walk_timeline(timeline)?;
                }
            }
            "Retweeters" => {
                if let Some(timeline) = data.pointer("/retweeters_timeline/timeline") {
                    self.walker(ictx).walk_timeline(timeline)?;
                }
            }
            "SearchTimeline" => {
                if let Some(timeline) =
                    data.pointer("/search_by_raw_query/search_timeline/timeline")
                {
                    self.walker(ictx).walk_timeline(timeline)?;
                }
            }
            "CreateTweet" => {
                if let Some(result) = data.pointer("/create_tweet/tweet_results/result") {
                    self.walker(ictx).add_tweet_result(result)?;
                }
            }
            "TweetResultsByRestIds" => {
                for tweet_result in data
                    .pointer("/tweetResult")
                    .and_then(Value::as_array)
                    .into_iter()
                    .flatten()
                {
                    if let Some(result) = tweet_result.get("result") {
                        self.walker(ictx).add_tweet_result(result)?;
                    }
                }
            }
            "ListPins" => {
                for list in data
                    .pointer("/viewer/pinned_lists")
                    .and_then(Value::as_array)
                    .into_iter()
                    .flatten()
                {
                    if let Some(name) = list.get("name").and_then(Value::as_str) {
                        info!("found list named {name}");
                    }
                }
            }
            other => {
                self.schema(format!("unknown endpoint {other}"))?;
            }
        }
        Ok(())
    }

    fn walker(&mut self, ictx: IngestCtx) -> Walker<'_> {
        Walker::new(self.store, ictx, self.strict)
    }

    /// Endpoints that nest their timeline inside the looked-up user.
    fn user_timeline(&mut self, ictx: IngestCtx, data: &Value) -> Result<Option<Value>> {
        let Some(result) = data.pointer("/user/result") else {
            return Ok(None);
        };
        let added = self.walker(ictx).add_user_result(result)?;
        let timeline = added
            .any_timeline()
            .and_then(|wrapper| wrapper.get("timeline").cloned());
        // locked accounts return an empty timeline object
        Ok(timeline.filter(|t| t.as_object().is_none_or(|map| !map.is_empty())))
    }

    fn gql_user_id(&self, ctx: &CaptureContext) -> Option<UserId> {
        match ctx.gql_vars().get("userId")? {
            Value::String(s) => s.parse().ok(),
            Value::Number(n) => n.as_i64(),
            _ => None,
        }
    }
}
