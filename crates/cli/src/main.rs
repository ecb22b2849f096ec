use chrono::{DateTime, Utc};
use parley_events::{ChatIdent, ChatKind, Event, FieldMap, Topic};
use parley_storage::{
    CacheStore, RangeQuery, RedisBackend, StorageError, StreamTransport, connect, keys,
};
use serde_json::Value;
use std::env;
use tokio::runtime::Builder;
use tracing::info;

const USAGE: &str = "usage: parley-cli <emit|init-groups|chats|history|pending|diagnose> [args]";

fn main() {
    let _ = dotenvy::dotenv();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()))
        .json()
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("failed to init tracing");
    let mut runtime = Builder::new_multi_thread();
    runtime.enable_all();
    let runtime = runtime.build().expect("failed to build runtime");
    if let Err(err) = runtime.block_on(async_main()) {
        eprintln!("error: {}", err);
        std::process::exit(1);
    }
}

async fn async_main() -> Result<(), String> {
    let mut args = env::args().skip(1).collect::<Vec<String>>();
    if args.is_empty() {
        return Err(USAGE.to_string());
    }
    let command = args.remove(0);
    match command.as_str() {
        "emit" => command_emit(args).await,
        "init-groups" => command_init_groups(args).await,
        "chats" => command_chats(args).await,
        "history" => command_history(args).await,
        "pending" => command_pending(args).await,
        "diagnose" => command_diagnose().await,
        other => Err(format!("unknown command: {}\n{}", other, USAGE)),
    }
}

/// `emit <topic> key=value...`
async fn command_emit(mut args: Vec<String>) -> Result<(), String> {
    if args.is_empty() {
        return Err("usage: parley-cli emit <topic> key=value...".to_string());
    }
    let topic = parse_topic(&args.remove(0))?;
    let fields = parse_fields(&args)?;
    let event = validate_event(topic, &fields)?;
    let backend = backend_connect().await?;
    let streams = backend.streams().await.map_err(storage_failure)?;
    let id = streams
        .append(event.topic().as_str(), &fields)
        .await
        .map_err(storage_failure)?;
    info!(topic = topic.as_str(), entry = %id, "event emitted");
    println!("{}", id);
    Ok(())
}

/// `init-groups [group]` creates the consumer group on every topic.
async fn command_init_groups(args: Vec<String>) -> Result<(), String> {
    let group = args
        .first()
        .cloned()
        .or_else(|| env::var("PARLEY_GROUP").ok())
        .unwrap_or_else(|| "projector".to_string());
    let backend = backend_connect().await?;
    let streams = backend.streams().await.map_err(storage_failure)?;
    for topic in Topic::ALL {
        streams
            .ensure_group(topic.as_str(), &group)
            .await
            .map_err(storage_failure)?;
        println!("{} {}", topic.as_str(), group);
    }
    Ok(())
}

/// `chats <user> [limit]`, most recent first.
async fn command_chats(args: Vec<String>) -> Result<(), String> {
    let user = args
        .first()
        .ok_or_else(|| "usage: parley-cli chats <user> [limit]".to_string())?;
    let limit = parse_limit(args.get(1))?;
    let backend = backend_connect().await?;
    let chats = backend
        .ordered_range(&keys::chats_sorted(user), &RangeQuery::latest(limit))
        .await
        .map_err(storage_failure)?;
    for (member, score) in chats {
        let chat = ChatIdent::parse(&member)
            .map(|ident| ident.to_string())
            .unwrap_or_else(|| format!("{} (unrecognised)", member));
        println!("{}\t{}", format_score(score), chat);
    }
    Ok(())
}

/// `history <direct|group> <owner> <chat> [limit]`, most recent first.
async fn command_history(args: Vec<String>) -> Result<(), String> {
    let [kind, owner, chat, rest @ ..] = args.as_slice() else {
        return Err("usage: parley-cli history <direct|group> <owner> <chat> [limit]".to_string());
    };
    let kind = match kind.as_str() {
        "direct" => ChatKind::Direct,
        "group" => ChatKind::Group,
        other => return Err(format!("unknown chat kind: {}", other)),
    };
    let limit = parse_limit(rest.first())?;
    let backend = backend_connect().await?;
    let page = backend
        .ordered_range(&keys::history(kind, owner, chat), &RangeQuery::latest(limit))
        .await
        .map_err(storage_failure)?;
    let entries = keys::history_entries(kind);
    for (che_id, score) in page {
        let stored = backend
            .get_field(entries, &che_id)
            .await
            .map_err(storage_failure)?;
        let rendered = match stored {
            Some(raw) => serde_json::from_str::<Value>(&raw)
                .map(|value| value.to_string())
                .unwrap_or(raw),
            None => "<missing entry>".to_string(),
        };
        println!("{}\t{}\t{}", format_score(score), che_id, rendered);
    }
    Ok(())
}

/// `pending [group]` prints the pending count of every topic.
async fn command_pending(args: Vec<String>) -> Result<(), String> {
    let group = args
        .first()
        .cloned()
        .or_else(|| env::var("PARLEY_GROUP").ok())
        .unwrap_or_else(|| "projector".to_string());
    let backend = backend_connect().await?;
    let streams = backend.streams().await.map_err(storage_failure)?;
    for topic in Topic::ALL {
        match streams.pending_count(topic.as_str(), &group).await {
            Ok(count) => println!("{}\t{}", topic.as_str(), count),
            Err(StorageError::MissingGroup(_)) => println!("{}\t-", topic.as_str()),
            Err(err) => return Err(storage_failure(err)),
        }
    }
    Ok(())
}

async fn command_diagnose() -> Result<(), String> {
    let backend = backend_connect().await?;
    backend.readiness().await.map_err(storage_failure)?;
    let probe = format!("diagnose:{}", Utc::now().timestamp_millis());
    backend
        .set_fields(&probe, &[("state".to_string(), "ok".to_string())])
        .await
        .map_err(storage_failure)?;
    let echoed = backend
        .get_field(&probe, "state")
        .await
        .map_err(storage_failure)?;
    backend
        .delete_fields(&probe, &["state".to_string()])
        .await
        .map_err(storage_failure)?;
    if echoed.as_deref() != Some("ok") {
        return Err("cache round trip returned unexpected value".to_string());
    }
    info!("diagnose complete");
    println!("ok");
    Ok(())
}

async fn backend_connect() -> Result<RedisBackend, String> {
    let redis =
        env::var("PARLEY_REDIS_URL").map_err(|_| "PARLEY_REDIS_URL not set".to_string())?;
    connect(&redis).await.map_err(storage_failure)
}

fn storage_failure(err: StorageError) -> String {
    format!("storage failure: {}", err)
}

fn parse_topic(value: &str) -> Result<Topic, String> {
    value.parse::<Topic>().map_err(|err| err.to_string())
}

fn parse_fields(args: &[String]) -> Result<FieldMap, String> {
    let mut fields = FieldMap::new();
    for arg in args {
        let (key, value) = arg
            .split_once('=')
            .ok_or_else(|| format!("expected key=value, got {}", arg))?;
        if key.is_empty() {
            return Err(format!("empty field name in {}", arg));
        }
        fields.insert(key.to_string(), value.to_string());
    }
    if fields.is_empty() {
        return Err("at least one field is required".to_string());
    }
    Ok(fields)
}

/// Projectors dead-letter what they cannot decode, so refuse it up front.
fn validate_event(topic: Topic, fields: &FieldMap) -> Result<Event, String> {
    Event::decode(topic, fields)
        .map_err(|err| format!("refusing malformed {} event: {}", topic.as_str(), err))
}

fn parse_limit(value: Option<&String>) -> Result<usize, String> {
    match value {
        Some(raw) => raw
            .parse::<usize>()
            .ok()
            .filter(|limit| *limit > 0)
            .ok_or_else(|| format!("invalid limit: {}", raw)),
        None => Ok(20),
    }
}

/// Scores carry epoch milliseconds in their integral part.
fn format_score(score: f64) -> String {
    DateTime::<Utc>::from_timestamp_millis(score.trunc() as i64)
        .map(|at| at.to_rfc3339())
        .unwrap_or_else(|| score.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fields_split_on_first_equals() {
        let fields = parse_fields(&[
            "username=alice".to_string(),
            "user_data={\"a\":\"b=c\"}".to_string(),
        ])
        .unwrap();
        assert_eq!(fields["username"], "alice");
        assert_eq!(fields["user_data"], "{\"a\":\"b=c\"}");
        assert!(parse_fields(&["novalue".to_string()]).is_err());
        assert!(parse_fields(&[]).is_err());
    }

    #[test]
    fn topics_and_limits_are_validated() {
        assert_eq!(parse_topic("new_users").unwrap(), Topic::NewUsers);
        assert!(parse_topic("old_users").is_err());
        assert_eq!(parse_limit(None).unwrap(), 20);
        assert!(parse_limit(Some(&"0".to_string())).is_err());
    }

    #[test]
    fn malformed_events_are_refused_before_append() {
        let valid = parse_fields(&[
            "username=alice".to_string(),
            "user_data={\"name\":\"Alice\"}".to_string(),
        ])
        .unwrap();
        let event = validate_event(Topic::NewUsers, &valid).unwrap();
        assert_eq!(event.topic(), Topic::NewUsers);

        let missing = parse_fields(&["username=alice".to_string()]).unwrap();
        let err = validate_event(Topic::NewUsers, &missing).unwrap_err();
        assert!(err.contains("user_data"), "{}", err);

        let garbled = parse_fields(&[
            "username=alice".to_string(),
            "user_data={not json".to_string(),
        ])
        .unwrap();
        assert!(validate_event(Topic::NewUsers, &garbled).is_err());
        assert!(validate_event(Topic::NewDirectMessages, &valid).is_err());
    }

    #[test]
    fn scores_render_as_timestamps() {
        assert_eq!(format_score(0.5), "1970-01-01T00:00:00+00:00");
    }
}
