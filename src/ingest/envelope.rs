//! Typed view of the GraphQL timeline envelope and the walker that feeds it
//! into the store.
//!
//! Responses arrive as instruction lists over polymorphic entries; every
//! level discriminates on a runtime tag. Each instruction and entry is
//! decoded individually so a single malformed record logs and skips instead
//! of poisoning the whole response (strict mode turns those into errors).

use serde::Deserialize;
use serde_json::Value;
use spdlog::prelude::*;

use crate::error::{Error, Result};
use crate::store::{
    de_opt_i64, Card, CardValue, CircleOwner, IngestCtx, LegacyPost, LegacyProfile, PostId,
    PostRecord, Store, UserId,
};

#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type")]
pub enum Instruction {
    #[serde(rename = "TimelineClearCache")]
    ClearCache,
    #[serde(rename = "TimelineTerminateTimeline")]
    TerminateTimeline,
    #[serde(rename = "TimelineShowAlert")]
    ShowAlert,
    #[serde(rename = "TimelineShowCover")]
    ShowCover,
    #[serde(rename = "TimelineReplaceEntry")]
    ReplaceEntry,
    #[serde(rename = "TimelinePinEntry")]
    PinEntry { entry: Entry },
    #[serde(rename = "TimelineAddToModule")]
    AddToModule {
        #[serde(rename = "moduleItems", default)]
        module_items: Vec<ModuleItem>,
    },
    #[serde(rename = "TimelineAddEntries")]
    AddEntries {
        #[serde(default)]
        entries: Vec<Entry>,
    },
}

#[derive(Clone, Debug, Deserialize)]
pub struct Entry {
    #[serde(rename = "entryId", default)]
    pub entry_id: Option<String>,
    #[serde(rename = "sortIndex", default, deserialize_with = "de_opt_i64")]
    pub sort_index: Option<i64>,
    pub content: Value,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "entryType")]
pub enum EntryContent {
    #[serde(rename = "TimelineTimelineItem")]
    Item {
        #[serde(rename = "itemContent")]
        item_content: Value,
        #[serde(rename = "clientEventInfo", default)]
        client_event_info: Option<ClientEventInfo>,
    },
    // "Who to follow", conversation threads, media grids
    #[serde(rename = "TimelineTimelineModule")]
    Module {
        #[serde(default)]
        items: Vec<ModuleItem>,
    },
    #[serde(rename = "TimelineTimelineCursor")]
    Cursor {
        #[serde(default)]
        value: Option<String>,
    },
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ClientEventInfo {
    #[serde(default)]
    pub component: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ModuleItem {
    #[serde(rename = "entryId", default)]
    pub entry_id: Option<String>,
    pub item: ModuleEntry,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ModuleEntry {
    #[serde(rename = "itemContent")]
    pub item_content: Value,
}

#[derive(Clone, Debug, Deserialize)]
pub struct TweetResults {
    #[serde(default)]
    pub result: Option<Value>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "__typename")]
pub enum TweetResult {
    Tweet(TweetNode),
    TweetWithVisibilityResults {
        tweet: TweetNode,
        #[serde(rename = "limitedActionResults", default)]
        limited_action_results: Option<Value>,
    },
    TweetTombstone,
    TweetUnavailable,
}

/// Mutation responses occasionally omit the type tag on plain tweets.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum TweetResultCompat {
    Tagged(TweetResult),
    Plain(TweetNode),
}

#[derive(Clone, Debug, Deserialize)]
pub struct TweetNode {
    #[serde(default, deserialize_with = "de_opt_i64")]
    pub rest_id: Option<PostId>,
    #[serde(default)]
    pub core: Option<TweetCore>,
    #[serde(default)]
    pub card: Option<CardNode>,
    #[serde(default)]
    pub legacy: Option<Value>,
    #[serde(default)]
    pub quoted_status_result: Option<TweetResults>,
    #[serde(default)]
    pub trusted_friends_info_result: Option<Value>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct TweetCore {
    #[serde(default)]
    pub user_results: Option<UserResults>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct UserResults {
    #[serde(default)]
    pub result: Option<Value>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "__typename")]
pub enum UserResult {
    User(UserNode),
    UserUnavailable,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum UserResultCompat {
    Tagged(UserResult),
    Plain(UserNode),
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct UserNode {
    #[serde(default, deserialize_with = "de_opt_i64")]
    pub rest_id: Option<UserId>,
    #[serde(default)]
    pub legacy: Option<LegacyProfile>,
    #[serde(default)]
    pub timeline: Option<Value>,
    #[serde(default)]
    pub timeline_v2: Option<Value>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct CardNode {
    #[serde(default)]
    pub legacy: Option<CardLegacy>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct CardLegacy {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub binding_values: Vec<BindingValue>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct BindingValue {
    pub key: String,
    #[serde(default)]
    pub value: Value,
}

const KNOWN_CARD_NAMES: &[&str] = &[
    "player",
    "summary",
    "summary_large_image",
    "promo_image_convo",
    "poll2choice_text_only",
    "poll3choice_text_only",
    "poll4choice_text_only",
    "unified_card",
    "promo_video_convo",
    "amplify",
];

const KNOWN_CARD_SUFFIXES: &[&str] = &[":live_event", ":broadcast", ":message_me", ":audiospace"];

const KNOWN_DISPLAY_TYPES: &[&str] = &["Tweet", "SelfThread", "MediaGrid", "CondensedTweet"];

/// One positional slot of a walked timeline. `id` is the contained post or
/// user id; tombstones and modules leave it empty.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LayoutEntry {
    pub sort_index: i64,
    pub name: Option<String>,
    pub id: Option<i64>,
}

#[derive(Debug, Default)]
pub struct WalkOutput {
    pub layout: Vec<LayoutEntry>,
    pub cursors: Vec<(Option<String>, String)>,
}

/// Ids resolved while persisting a tweet node: its own id and the id of the
/// post it republishes (itself, if not a repost).
#[derive(Clone, Copy, Debug)]
pub struct AddedTweet {
    pub rest_id: Option<PostId>,
    pub original_id: Option<PostId>,
}

pub struct AddedUser {
    pub uid: Option<UserId>,
    pub timeline: Option<Value>,
    pub timeline_v2: Option<Value>,
}

impl AddedUser {
    const EMPTY: AddedUser = AddedUser {
        uid: None,
        timeline: None,
        timeline_v2: None,
    };

    /// Whichever timeline generation the endpoint carries.
    pub fn any_timeline(self) -> Option<Value> {
        self.timeline_v2.or(self.timeline)
    }
}

pub struct Walker<'a> {
    pub store: &'a mut Store,
    pub ctx: IngestCtx,
    pub strict: bool,
}

impl<'a> Walker<'a> {
    pub fn new(store: &'a mut Store, ctx: IngestCtx, strict: bool) -> Self {
        Walker { store, ctx, strict }
    }

    /// Logs and continues in production, fails in development.
    fn schema(&self, msg: impl Into<String>) -> Result<()> {
        let msg = msg.into();
        if self.strict {
            return Err(Error::Schema(msg));
        }
        warn!("schema deviation: {msg}");
        Ok(())
    }

    /// Walks a `{"instructions": [...]}` timeline object, persisting every
    /// post/profile it mentions and collecting positional layout for callers
    /// that need it (likes, bookmarks, follow rolls).
    pub fn walk_timeline(&mut self, timeline: &Value) -> Result<WalkOutput> {
        let mut out = WalkOutput::default();
        let Some(instructions) = timeline.get("instructions").and_then(Value::as_array) else {
            self.schema("timeline without instructions")?;
            return Ok(out);
        };

        for raw in instructions {
            let instruction: Instruction = match serde_json::from_value(raw.clone()) {
                Ok(instruction) => instruction,
                Err(err) => {
                    self.schema(format!("unhandled timeline instruction: {err}"))?;
                    continue;
                }
            };
            match instruction {
                Instruction::ClearCache
                | Instruction::TerminateTimeline
                | Instruction::ShowAlert
                | Instruction::ShowCover
                | Instruction::ReplaceEntry => {}
                Instruction::PinEntry { entry } => self.walk_entry(entry, &mut out),
                Instruction::AddEntries { entries } => {
                    for entry in entries {
                        self.walk_entry(entry, &mut out);
                    }
                }
                Instruction::AddToModule { module_items } => {
                    for item in module_items {
                        if let Err(err) =
                            self.item_content(&item.item.item_content, item.entry_id.as_deref(), None)
                        {
                            warn!("skipping module item: {err}");
                        }
                    }
                }
            }
        }
        Ok(out)
    }

    fn walk_entry(&mut self, entry: Entry, out: &mut WalkOutput) {
        let name = entry.entry_id;
        let sort_index = entry.sort_index.unwrap_or_default();
        let content: EntryContent = match serde_json::from_value(entry.content) {
            Ok(content) => content,
            Err(err) => {
                warn!("skipping timeline entry {name:?}: {err}");
                return;
            }
        };

        match content {
            EntryContent::Item {
                item_content,
                client_event_info,
            } => {
                match client_event_info.and_then(|info| info.component).as_deref() {
                    Some("suggest_promoted") => return, // ad
                    Some("related_tweet") => return,    // garbage
                    // organic suggestions inside a profile scroll are fine
                    _ => {}
                }
                match self.item_content(&item_content, name.as_deref(), Some(&mut out.cursors)) {
                    Ok(id) => out.layout.push(LayoutEntry {
                        sort_index,
                        name,
                        id,
                    }),
                    Err(err) => warn!("skipping timeline item {name:?}: {err}"),
                }
            }
            EntryContent::Module { items } => {
                for item in items {
                    if let Err(err) =
                        self.item_content(&item.item.item_content, item.entry_id.as_deref(), None)
                    {
                        warn!("skipping module item: {err}");
                    }
                }
                out.layout.push(LayoutEntry {
                    sort_index,
                    name,
                    id: None,
                });
            }
            EntryContent::Cursor { value } => {
                if let Some(value) = value {
                    out.cursors.push((name, value));
                }
            }
        }
    }

    /// Dispatches one item-content node by its type tag. Returns the id the
    /// node contributes to the layout (post id or user id).
    fn item_content(
        &mut self,
        content: &Value,
        name: Option<&str>,
        cursors: Option<&mut Vec<(Option<String>, String)>>,
    ) -> Result<Option<i64>> {
        let Some(typename) = content.get("__typename").and_then(Value::as_str) else {
            self.schema("item content without __typename")?;
            return Ok(None);
        };
        match typename {
            "TimelineUser" => {
                let Some(result) = content.pointer("/user_results/result") else {
                    return Ok(None);
                };
                Ok(self.add_user_result(result)?.uid)
            }
            "TimelineTweet" => {
                if content.get("promotedMetadata").is_some() {
                    return Ok(None);
                }
                if let Some(display) = content.get("tweetDisplayType").and_then(Value::as_str) {
                    if !KNOWN_DISPLAY_TYPES.contains(&display) {
                        self.schema(format!("unknown tweet display type {display}"))?;
                    }
                }
                // empty tweet_results happens in like timelines
                let Some(result) = content.pointer("/tweet_results/result") else {
                    return Ok(None);
                };
                Ok(self.add_tweet_result(result)?.and_then(|added| added.rest_id))
            }
            // cursors of detail views arrive as items
            "TimelineTimelineCursor" => {
                if let (Some(cursors), Some(value)) =
                    (cursors, content.get("value").and_then(Value::as_str))
                {
                    cursors.push((name.map(str::to_owned), value.to_owned()));
                }
                Ok(None)
            }
            "TimelineTweetComposer"
            | "TimelineTombstone"
            | "TimelineCommunity"
            | "TimelineMessagePrompt"
            | "TimelineLabel"
            | "TimelinePrompt"
            | "TimelineSpelling"
            | "TimelineTrend" => Ok(None),
            other => {
                self.schema(format!("unknown item content type {other}"))?;
                Ok(None)
            }
        }
    }

    /// Persists a tweet result node, recursing into the reposted and quoted
    /// posts first so the parentage resolves to stored posts.
    pub fn add_tweet_result(&mut self, value: &Value) -> Result<Option<AddedTweet>> {
        let parsed: TweetResultCompat = serde_json::from_value(value.clone())
            .map_err(|err| Error::Schema(format!("unhandled tweet result shape: {err}")))?;

        let (node, limited_action_results) = match parsed {
            TweetResultCompat::Tagged(TweetResult::TweetTombstone)
            | TweetResultCompat::Tagged(TweetResult::TweetUnavailable) => return Ok(None),
            TweetResultCompat::Tagged(TweetResult::Tweet(node)) => (node, None),
            TweetResultCompat::Tagged(TweetResult::TweetWithVisibilityResults {
                tweet,
                limited_action_results,
            }) => (tweet, limited_action_results),
            TweetResultCompat::Plain(node) => (node, None),
        };

        // The only machine hint that a visibility-wrapped post was a circle
        // post is the wrapper mentioning it.
        let heuristically_circle = limited_action_results
            .as_ref()
            .and_then(|lar| serde_json::to_string(lar).ok())
            .is_some_and(|text| text.contains("Circle"));

        let Some(mut legacy_value) = node.legacy else {
            self.schema(format!(
                "tweet node {:?} without legacy payload",
                node.rest_id
            ))?;
            return Ok(None);
        };

        if let Some(user_result) = node
            .core
            .as_ref()
            .and_then(|core| core.user_results.as_ref())
            .and_then(|results| results.result.as_ref())
        {
            self.add_user_result(user_result)?;
        }

        let card = match node.card.and_then(|card| card.legacy) {
            Some(card_legacy) => Some(self.convert_card(card_legacy)?),
            None => None,
        };

        // reposts: the wrapped post is ingested first and becomes the parent
        let retweeted = legacy_value
            .as_object_mut()
            .and_then(|obj| obj.remove("retweeted_status_result"));
        let mut original_id = None;
        if let Some(result) = retweeted.as_ref().and_then(|rt| rt.get("result")) {
            original_id = self.add_tweet_result(result)?.and_then(|added| added.original_id);
        }

        if let Some(result) = node
            .quoted_status_result
            .as_ref()
            .and_then(|quoted| quoted.result.as_ref())
        {
            self.add_tweet_result(result)?;
        }

        let mut legacy: LegacyPost = serde_json::from_value(legacy_value)
            .map_err(|err| Error::Schema(format!("unhandled legacy tweet shape: {err}")))?;
        if legacy.id_str.is_none() {
            legacy.id_str = node.rest_id;
        }

        let circle = match node.trusted_friends_info_result.as_ref() {
            Some(info) => {
                // a suppressed limited-actions marker is restored for circle posts
                if legacy.limited_actions.is_none() {
                    legacy.limited_actions = Some("limit_trusted_friends_tweet".to_owned());
                }
                self.convert_circle(info)?
            }
            None => {
                if legacy.limited_actions.as_deref() != Some("limit_trusted_friends_tweet")
                    && heuristically_circle
                {
                    warn!(
                        "no machine readable way to tell that {:?} was a circle post",
                        legacy.id_str
                    );
                    legacy.limited_actions = Some("limit_trusted_friends_tweet".to_owned());
                }
                None
            }
        };

        let rest_id = legacy.id_str.or(node.rest_id);
        let original_id = match original_id {
            Some(id) => id,
            None => match rest_id {
                Some(id) => id,
                None => {
                    self.schema("tweet node without any id")?;
                    return Ok(None);
                }
            },
        };

        let record = PostRecord {
            legacy,
            original_id,
            card,
            circle,
        };
        self.store.add_post(&self.ctx, record);
        Ok(Some(AddedTweet {
            rest_id,
            original_id: Some(original_id),
        }))
    }

    fn convert_card(&mut self, card: CardLegacy) -> Result<Card> {
        if let Some(card_name) = card.name.as_deref() {
            let known = KNOWN_CARD_NAMES.contains(&card_name)
                || KNOWN_CARD_SUFFIXES
                    .iter()
                    .any(|suffix| card_name.ends_with(suffix));
            if !known {
                self.schema(format!("unknown card kind {card_name}"))?;
            }
        }
        // binding values flatten from a list of pairs into a map; values
        // without a type tag degrade to Other
        let binding_values = card
            .binding_values
            .into_iter()
            .map(|kv| {
                let value =
                    serde_json::from_value::<CardValue>(kv.value).unwrap_or(CardValue::Other);
                (kv.key, value)
            })
            .collect();
        Ok(Card {
            name: card.name,
            binding_values,
        })
    }

    fn convert_circle(&mut self, info: &Value) -> Result<Option<CircleOwner>> {
        if info.get("__typename").and_then(Value::as_str) != Some("ApiTrustedFriendsInfo") {
            self.schema("unexpected trusted friends payload")?;
            return Ok(None);
        }
        let owner = info.pointer("/owner_results/result/legacy");
        let screen_name = owner
            .and_then(|legacy| legacy.get("screen_name"))
            .and_then(Value::as_str);
        let name = owner
            .and_then(|legacy| legacy.get("name"))
            .and_then(Value::as_str);
        match (screen_name, name) {
            (Some(screen_name), Some(name)) => Ok(Some(CircleOwner {
                screen_name: screen_name.to_owned(),
                name: name.to_owned(),
            })),
            _ => {
                self.schema("trusted friends owner without identity")?;
                Ok(None)
            }
        }
    }

    /// Persists a user result node; hands back the timeline payloads some
    /// endpoints nest inside the user.
    pub fn add_user_result(&mut self, value: &Value) -> Result<AddedUser> {
        let parsed: UserResultCompat = serde_json::from_value(value.clone())
            .map_err(|err| Error::Schema(format!("unhandled user result shape: {err}")))?;
        let node = match parsed {
            UserResultCompat::Tagged(UserResult::UserUnavailable) => return Ok(AddedUser::EMPTY),
            UserResultCompat::Tagged(UserResult::User(node)) => node,
            UserResultCompat::Plain(node) => node,
        };
        let Some(uid) = node.rest_id else {
            // an entirely empty user object shows up in avatar endpoints
            return Ok(AddedUser::EMPTY);
        };
        if let Some(legacy) = node.legacy {
            self.store.add_profile(&self.ctx, uid, legacy);
        }
        Ok(AddedUser {
            uid: Some(uid),
            timeline: node.timeline,
            timeline_v2: node.timeline_v2,
        })
    }
}
