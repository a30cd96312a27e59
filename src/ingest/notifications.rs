//! The legacy notifications endpoint: a flat `globalObjects` bag of users and
//! tweets plus notification templates. Heart notifications reveal likes with
//! unknown list position, which feed the unsorted channel.

use serde_json::Value;
use spdlog::prelude::*;

use crate::error::Result;
use crate::store::{IngestCtx, LegacyPost, LegacyProfile, PostRecord};

use super::Dispatcher;

const KNOWN_ICONS: &[&str] = &[
    "heart_icon",
    "safety_icon",
    "retweet_icon",
    "person_icon",
    "topic_icon",
    "bell_icon",
    "milestone_icon",
    "recommendation_icon",
    "histogram_icon",
    "bird_icon",
    "spaces_icon",
    "live_icon",
    "birdwatch_icon",
    "lightning_bolt_icon",
    "trending_icon",
    "play_icon",
];

pub(super) fn load(dispatcher: &mut Dispatcher<'_>, ctx: &IngestCtx, data: &Value) -> Result<()> {
    if data.get("errors").is_some() && data.get("globalObjects").is_none() {
        return Ok(());
    }
    let Some(global_objects) = data.get("globalObjects") else {
        dispatcher.schema("notifications without globalObjects")?;
        return Ok(());
    };

    for (uid, user) in global_objects
        .get("users")
        .and_then(Value::as_object)
        .into_iter()
        .flatten()
    {
        let (Ok(uid), Ok(profile)) = (
            uid.parse(),
            serde_json::from_value::<LegacyProfile>(user.clone()),
        ) else {
            dispatcher.schema(format!("unreadable notification user {uid}"))?;
            continue;
        };
        dispatcher.store.add_profile(ctx, uid, profile);
    }

    for (twid, tweet) in global_objects
        .get("tweets")
        .and_then(Value::as_object)
        .into_iter()
        .flatten()
    {
        // null-valued reply/geo fields in this envelope mean "absent", which
        // the lenient record deserialization already treats them as
        let legacy: LegacyPost = match serde_json::from_value(tweet.clone()) {
            Ok(legacy) => legacy,
            Err(err) => {
                dispatcher.schema(format!("unreadable notification tweet {twid}: {err}"))?;
                continue;
            }
        };
        let Some(id) = legacy.id_str else {
            continue;
        };
        let original_id = legacy.retweeted_status_id_str.unwrap_or(id);
        dispatcher
            .store
            .add_post(ctx, PostRecord::plain(legacy, original_id));
    }

    for (nid, notification) in global_objects
        .get("notifications")
        .and_then(Value::as_object)
        .into_iter()
        .flatten()
    {
        let icon = notification
            .pointer("/icon/id")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if !KNOWN_ICONS.contains(&icon) {
            dispatcher.schema(format!("unknown notification icon {icon} on {nid}"))?;
            continue;
        }
        if icon != "heart_icon" {
            continue;
        }
        let Some(template) = notification
            .pointer("/template/aggregateUserActionsV1")
        else {
            dispatcher.schema(format!("unexpected notification template on {nid}"))?;
            continue;
        };

        let ids = |key: &str, inner: &str| -> Vec<i64> {
            template
                .get(key)
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
                .filter_map(|entry| entry.pointer(&format!("/{inner}/id")))
                .filter_map(|id| match id {
                    Value::String(s) => s.parse().ok(),
                    Value::Number(n) => n.as_i64(),
                    _ => None,
                })
                .collect()
        };
        let likers = ids("fromUsers", "user");
        let targets = ids("targetObjects", "tweet");
        for &liker in &likers {
            for &target in &targets {
                dispatcher.store.add_unsorted_like(liker, target);
            }
        }
        debug!("notification {nid}: {} likes over {} posts", likers.len(), targets.len());
    }

    Ok(())
}
