//! Per-protocol response builders.
//!
//! Each handler is stateless per request: validate, route, serve from
//! cache or query-and-render, never panic toward the client.

use std::time::Duration;

use nostr::nips::nip19::ToBech32 as _;
use tracing::debug;

use nophr_cache::keys;
use nophr_render::{
    event_to_gemtext, event_to_plain, format_timestamp, gemtext, gophermap, summary_line,
    RenderOptions,
};

use crate::content::EventView;
use crate::diagnostics;
use crate::router::{archive_bounds, resolve, Feed, Route, RouteError};
use crate::AppState;

const LOG_TARGET: &str = "nophr::server";

const SUMMARY_LEN: usize = 60;
const DIAGNOSTICS_TTL: Duration = Duration::from_secs(30);

fn render_options(style: &nophr_config::RenderStyle) -> RenderOptions {
    RenderOptions {
        max_line_length: style.max_line_length,
        show_timestamps: style.show_timestamps,
        date_format: style.date_format.clone(),
        thread_indent: style.thread_indent,
        emoji: style.emoji,
    }
}

/// Cache key for a routed response.
///
/// Views derived from events live under the granular key families so
/// ingest-time invalidation clears them; root, archives and
/// diagnostics key on the raw request.
fn cache_key_for(route: &Route, protocol: &str, raw_key: &str) -> String {
    match route {
        Route::Feed { feed, page } => keys::section(
            match feed {
                Feed::Notes => "notes",
                Feed::Articles => "articles",
                Feed::Replies => "replies",
                Feed::Mentions => "mentions",
            },
            protocol,
            *page,
        ),
        Route::Section { name, page } => keys::section(name, protocol, *page),
        Route::Event { id } => keys::event(&id.to_hex(), protocol, "full"),
        Route::Thread { id } => keys::thread(&id.to_hex(), protocol),
        Route::Profile { pubkey } => keys::profile(&pubkey.to_hex(), protocol),
        Route::Legacy { target, .. } => cache_key_for(target, protocol, raw_key),
        Route::Root | Route::Archive { .. } | Route::Diagnostics => raw_key.to_owned(),
    }
}

impl AppState {
    fn response_ttl(&self, route: &Route) -> Duration {
        let caching = &self.config.caching;
        let default = Duration::from_secs(caching.default_ttl_seconds.max(1));
        let section_ttl = |name: &str| {
            caching
                .ttl
                .sections
                .get(name)
                .map(|secs| Duration::from_secs(*secs))
                .unwrap_or(default)
        };
        let render_ttl = |family: &str| {
            caching
                .ttl
                .render
                .get(family)
                .map(|secs| Duration::from_secs(*secs))
                .unwrap_or(default)
        };
        match route {
            Route::Root => default,
            Route::Feed { feed, .. } => section_ttl(match feed {
                Feed::Notes => "notes",
                Feed::Articles => "articles",
                Feed::Replies => "replies",
                Feed::Mentions => "mentions",
            }),
            Route::Section { name, .. } | Route::Archive { section: name, .. } => {
                section_ttl(name)
            }
            Route::Event { .. } => render_ttl("event"),
            Route::Thread { .. } => render_ttl("thread"),
            Route::Profile { .. } => render_ttl("profile"),
            Route::Diagnostics => DIAGNOSTICS_TTL.min(default),
            Route::Legacy { target, .. } => self.response_ttl(target),
        }
    }

    fn date_line(&self, view: &EventView, style: &nophr_config::RenderStyle) -> String {
        if style.show_timestamps {
            format!(
                "{} ",
                format_timestamp(view.event.created_at.as_u64(), &style.date_format)
            )
        } else {
            String::new()
        }
    }
}

/// Per-list presentation knobs from section config.
#[derive(Debug, Clone, Copy, Default)]
struct ListStyle {
    show_dates: bool,
    show_authors: bool,
    group_by_day: bool,
}

impl ListStyle {
    fn for_feed() -> Self {
        Self {
            show_dates: true,
            show_authors: false,
            group_by_day: false,
        }
    }

    fn for_section(section: &nophr_config::Section) -> Self {
        Self {
            show_dates: section.show_dates,
            show_authors: section.show_authors,
            group_by_day: section.group_by.as_deref() == Some("day"),
        }
    }
}

fn entry_label(
    state: &AppState,
    view: &EventView,
    style: &nophr_config::RenderStyle,
    list: ListStyle,
) -> String {
    let mut label = String::new();
    if list.show_dates {
        label.push_str(&state.date_line(view, style));
    }
    if list.show_authors {
        let author = view.event.pubkey.to_hex();
        label.push_str(&format!("<{}> ", &author[..8]));
    }
    label.push_str(&summary_line(&view.event, SUMMARY_LEN));
    label
}

fn day_of(view: &EventView, style: &nophr_config::RenderStyle) -> String {
    format_timestamp(view.event.created_at.as_u64(), &style.date_format)
}

// ---------------------------------------------------------------------------
// Gopher
// ---------------------------------------------------------------------------

pub async fn respond_gopher(state: &AppState, selector: &str) -> Vec<u8> {
    let mut validation = state.config.security.validation.clone();
    validation.max_path_length = validation.max_selector_length;

    let route = match resolve(selector, &validation) {
        Ok(Route::Legacy { target, .. }) => *target,
        Ok(route) => route,
        Err(reason) => return gopher_error(state, selector, reason),
    };

    let cache_key = cache_key_for(&route, "gopher", &keys::gopher(selector));
    if let Some(hit) = state.node.cache.get(&cache_key).await {
        return hit;
    }

    let body = build_gopher(state, &route).await;
    let bytes = body.into_bytes();
    state
        .node
        .cache
        .set(&cache_key, bytes.clone(), state.response_ttl(&route))
        .await;
    bytes
}

fn gopher_map(state: &AppState) -> gophermap::Gophermap {
    let gopher = &state.config.protocols.gopher;
    gophermap::Gophermap::new(gopher.host.clone(), gopher.port)
}

/// Rate-limit response in gophermap form.
pub fn slow_down_map(state: &AppState) -> gophermap::Gophermap {
    let mut map = gopher_map(state);
    map.error("Too many requests, slow down");
    map
}

fn gopher_error(state: &AppState, selector: &str, reason: RouteError) -> Vec<u8> {
    debug!(target: LOG_TARGET, selector, ?reason, "Gopher error response");
    let mut map = gopher_map(state);
    match reason {
        RouteError::Invalid => map.error("Malformed selector"),
        RouteError::NotFound => map.error(&format!("No such selector: {selector}")),
    };
    map.menu("Back to the top", "/");
    map.finish().into_bytes()
}

async fn build_gopher(state: &AppState, route: &Route) -> String {
    let style = &state.config.rendering.gopher;
    let opts = render_options(style);

    match route {
        Route::Root => {
            let mut map = gopher_map(state);
            map.info(&state.config.site.title);
            map.info_block(&state.config.site.description);
            map.info(&format!("operated by {}", state.config.site.operator));
            map.blank();
            for feed in [Feed::Notes, Feed::Articles, Feed::Replies, Feed::Mentions] {
                map.menu(feed.title(), feed.path());
            }
            for (name, section) in state.ordered_sections() {
                let path = section
                    .path
                    .clone()
                    .unwrap_or_else(|| format!("/section/{name}"));
                map.menu(&section.title, &path);
                if !section.description.is_empty() {
                    map.info(&section.description);
                }
            }
            map.blank();
            map.menu(
                "Profile",
                &format!("/profile/{}", state.config.owner.to_hex()),
            );
            map.menu("Diagnostics", "/diagnostics");
            map.finish()
        }
        Route::Feed { feed, page } => {
            let views = state
                .feed_events(*feed, *page, default_page_size(state))
                .await;
            let mut map = gopher_map(state);
            map.info(&format!("{} - page {page}", feed.title()));
            map.blank();
            gopher_event_list(state, &mut map, &views, style, ListStyle::for_feed());
            if views.len() == default_page_size(state) {
                map.menu("More", &format!("{}/{}", feed.path(), page + 1));
            }
            map.finish()
        }
        Route::Section { name, page } => match state.config.layout.sections.get(name) {
            Some(section) => {
                let views = state.section_events(section, *page, None).await;
                let mut map = gopher_map(state);
                map.info(&section.title);
                if !section.description.is_empty() {
                    map.info(&section.description);
                }
                map.blank();
                gopher_event_list(state, &mut map, &views, style, ListStyle::for_section(section));
                if views.len() == section.limit.max(1) {
                    map.menu("More", &format!("/section/{name}/{}", page + 1));
                }
                if let Some(more) = &section.more_link {
                    map.menu(&more.text, &format!("/section/{}", more.section_ref));
                }
                map.finish()
            }
            None => {
                let mut map = gopher_map(state);
                map.error(&format!("No such section: {name}"));
                map.menu("Back to the top", "/");
                map.finish()
            }
        },
        Route::Archive {
            section,
            year,
            month,
            day,
        } => {
            let bounds = archive_bounds(*year, *month, *day);
            match (state.config.layout.sections.get(section), bounds) {
                (Some(section_cfg), Some(bounds)) => {
                    let views = state.section_events(section_cfg, 1, Some(bounds)).await;
                    let mut map = gopher_map(state);
                    map.info(&format!("{} archive {}", section_cfg.title, year));
                    map.blank();
                    gopher_event_list(state, &mut map, &views, style, ListStyle::for_section(section_cfg));
                    map.finish()
                }
                _ => {
                    let mut map = gopher_map(state);
                    map.error("No such archive");
                    map.menu("Back to the top", "/");
                    map.finish()
                }
            }
        }
        Route::Event { id } => match state.event_by_id(id).await {
            Some(view) => gophermap::text_document(&event_to_plain(
                &view.event,
                view.interactions,
                &opts,
            )),
            None => {
                let mut map = gopher_map(state);
                map.error("No such event");
                map.menu("Back to the top", "/");
                map.finish()
            }
        },
        Route::Thread { id } => match state.thread_view(id).await {
            Some((root, replies)) => {
                let mut body = event_to_plain(&root.event, root.interactions, &opts);
                let indent = " ".repeat(style.thread_indent);
                for reply in &replies {
                    body.push('\n');
                    let rendered = event_to_plain(&reply.event, reply.interactions, &opts);
                    for line in rendered.lines() {
                        body.push_str(&indent);
                        body.push_str(line);
                        body.push('\n');
                    }
                }
                gophermap::text_document(&body)
            }
            None => {
                let mut map = gopher_map(state);
                map.error("No such thread");
                map.menu("Back to the top", "/");
                map.finish()
            }
        },
        Route::Profile { pubkey } => {
            let (fields, notes) = state
                .profile_view(pubkey, style.recent_notes_count.max(1))
                .await;
            let mut map = gopher_map(state);
            let npub = pubkey.to_bech32().unwrap_or_else(|_| pubkey.to_hex());
            map.info(fields.best_name().unwrap_or("anonymous"));
            map.info(&npub);
            if let Some(about) = &fields.about {
                map.blank();
                map.info_block(about);
            }
            map.blank();
            gopher_event_list(state, &mut map, &notes, style, ListStyle::for_feed());
            map.finish()
        }
        Route::Diagnostics => gophermap::text_document(&diagnostics::build(state).await),
        Route::Legacy { target, .. } => Box::pin(build_gopher(state, target)).await,
    }
}

fn gopher_event_list(
    state: &AppState,
    map: &mut gophermap::Gophermap,
    views: &[EventView],
    style: &nophr_config::RenderStyle,
    list: ListStyle,
) {
    if views.is_empty() {
        map.info("(nothing here yet)");
        return;
    }
    let mut last_day: Option<String> = None;
    for view in views {
        if list.group_by_day {
            let day = day_of(view, style);
            if last_day.as_deref() != Some(day.as_str()) {
                if last_day.is_some() {
                    map.blank();
                }
                map.info(&day);
                last_day = Some(day);
            }
        }
        map.text(
            &entry_label(state, view, style, list),
            &format!("/event/{}", view.event.id.to_hex()),
        );
        if !view.interactions.is_empty() {
            map.item(
                gophermap::ItemType::Menu,
                &format!("  thread ({} replies)", view.interactions.replies),
                &format!("/thread/{}", view.event.id.to_hex()),
            );
        }
    }
}

fn default_page_size(state: &AppState) -> usize {
    state
        .config
        .layout
        .sections
        .get("notes")
        .map(|section| section.limit)
        .unwrap_or(20)
        .max(1)
}

// ---------------------------------------------------------------------------
// Gemini
// ---------------------------------------------------------------------------

pub async fn respond_gemini(state: &AppState, path: &str, query: Option<&str>) -> Vec<u8> {
    let validation = &state.config.security.validation;
    if let Some(query) = query {
        if validation.enabled && validation.max_query_length < query.len() {
            return gemtext::response(gemtext::Status::BadRequest, "query too long", None);
        }
    }

    let route = match resolve(path, validation) {
        Ok(Route::Legacy { canonical, .. }) => {
            return gemtext::response(gemtext::Status::RedirectPermanent, canonical, None);
        }
        Ok(route) => route,
        Err(RouteError::Invalid) => {
            return gemtext::response(gemtext::Status::BadRequest, "malformed request", None);
        }
        Err(RouteError::NotFound) => {
            return gemtext::response(gemtext::Status::NotFound, "no such path", None);
        }
    };

    let cache_key = cache_key_for(&route, "gemini", &keys::gemini(path, query));
    if let Some(hit) = state.node.cache.get(&cache_key).await {
        return hit;
    }

    let bytes = match build_gemini(state, &route).await {
        Some(body) => gemtext::success(&body),
        None => gemtext::response(gemtext::Status::NotFound, "no such path", None),
    };
    state
        .node
        .cache
        .set(&cache_key, bytes.clone(), state.response_ttl(&route))
        .await;
    bytes
}

async fn build_gemini(state: &AppState, route: &Route) -> Option<String> {
    let style = &state.config.rendering.gemini;
    let opts = render_options(style);

    let body = match route {
        Route::Root => {
            let mut doc = gemtext::Gemtext::new();
            doc.heading(1, &state.config.site.title);
            doc.line(&state.config.site.description);
            doc.line(&format!("operated by {}", state.config.site.operator));
            doc.blank();
            for feed in [Feed::Notes, Feed::Articles, Feed::Replies, Feed::Mentions] {
                doc.link(feed.path(), feed.title());
            }
            for (name, section) in state.ordered_sections() {
                let path = section
                    .path
                    .clone()
                    .unwrap_or_else(|| format!("/section/{name}"));
                doc.link(&path, &section.title);
            }
            doc.blank();
            doc.link(
                &format!("/profile/{}", state.config.owner.to_hex()),
                "Profile",
            );
            doc.link("/diagnostics", "Diagnostics");
            doc.finish()
        }
        Route::Feed { feed, page } => {
            let views = state
                .feed_events(*feed, *page, default_page_size(state))
                .await;
            let mut doc = gemtext::Gemtext::new();
            doc.heading(1, feed.title());
            doc.blank();
            gemini_event_list(state, &mut doc, &views, style, ListStyle::for_feed());
            if views.len() == default_page_size(state) {
                doc.blank();
                doc.link(&format!("{}/{}", feed.path(), page + 1), "More");
            }
            doc.finish()
        }
        Route::Section { name, page } => {
            let section = state.config.layout.sections.get(name)?;
            let views = state.section_events(section, *page, None).await;
            let mut doc = gemtext::Gemtext::new();
            doc.heading(1, &section.title);
            if !section.description.is_empty() {
                doc.line(&section.description);
            }
            doc.blank();
            gemini_event_list(state, &mut doc, &views, style, ListStyle::for_section(section));
            if views.len() == section.limit.max(1) {
                doc.blank();
                doc.link(&format!("/section/{name}/{}", page + 1), "More");
            }
            doc.finish()
        }
        Route::Archive {
            section,
            year,
            month,
            day,
        } => {
            let section_cfg = state.config.layout.sections.get(section)?;
            let bounds = archive_bounds(*year, *month, *day)?;
            let views = state.section_events(section_cfg, 1, Some(bounds)).await;
            let mut doc = gemtext::Gemtext::new();
            doc.heading(1, &format!("{} archive {year}", section_cfg.title));
            doc.blank();
            gemini_event_list(state, &mut doc, &views, style, ListStyle::for_section(section_cfg));
            doc.finish()
        }
        Route::Event { id } => {
            let view = state.event_by_id(id).await?;
            let mut doc = gemtext::Gemtext::new();
            doc.raw(&event_to_gemtext(&view.event, view.interactions, &opts));
            doc.blank();
            doc.link(&format!("/thread/{}", id.to_hex()), "Thread");
            doc.link(
                &format!("/profile/{}", view.event.pubkey.to_hex()),
                "Author",
            );
            doc.finish()
        }
        Route::Thread { id } => {
            let (root, replies) = state.thread_view(id).await?;
            let mut doc = gemtext::Gemtext::new();
            doc.heading(1, "Thread");
            doc.blank();
            doc.raw(&event_to_gemtext(&root.event, root.interactions, &opts));
            for reply in &replies {
                doc.blank();
                doc.line("-- reply --");
                doc.raw(&event_to_gemtext(&reply.event, reply.interactions, &opts));
            }
            doc.finish()
        }
        Route::Profile { pubkey } => {
            let (fields, notes) = state
                .profile_view(pubkey, style.recent_notes_count.max(1))
                .await;
            let npub = pubkey.to_bech32().unwrap_or_else(|_| pubkey.to_hex());
            let mut doc = gemtext::Gemtext::new();
            doc.heading(1, fields.best_name().unwrap_or("anonymous"));
            doc.line(&npub);
            if let Some(about) = &fields.about {
                doc.blank();
                doc.line(about);
            }
            doc.blank();
            doc.heading(2, "Recent notes");
            gemini_event_list(state, &mut doc, &notes, style, ListStyle::for_feed());
            doc.finish()
        }
        Route::Diagnostics => {
            let mut doc = gemtext::Gemtext::new();
            doc.heading(1, "Diagnostics");
            doc.blank();
            for line in diagnostics::build(state).await.lines() {
                doc.line(line);
            }
            doc.finish()
        }
        Route::Legacy { target, .. } => return Box::pin(build_gemini(state, target)).await,
    };
    Some(body)
}

fn gemini_event_list(
    state: &AppState,
    doc: &mut gemtext::Gemtext,
    views: &[EventView],
    style: &nophr_config::RenderStyle,
    list: ListStyle,
) {
    if views.is_empty() {
        doc.line("(nothing here yet)");
        return;
    }
    let mut last_day: Option<String> = None;
    for view in views {
        if list.group_by_day {
            let day = day_of(view, style);
            if last_day.as_deref() != Some(day.as_str()) {
                doc.blank();
                doc.heading(3, &day);
                last_day = Some(day);
            }
        }
        doc.link(
            &format!("/event/{}", view.event.id.to_hex()),
            &entry_label(state, view, style, list),
        );
    }
}

// ---------------------------------------------------------------------------
// Finger
// ---------------------------------------------------------------------------

pub async fn respond_finger(state: &AppState, raw_query: &str) -> Vec<u8> {
    let validation = &state.config.security.validation;
    let query = raw_query.trim();
    if validation.enabled
        && (validation.max_query_length < query.len() || query.contains(['\0']))
    {
        return b"Malformed query.\r\n".to_vec();
    }
    // `/W` verbosity flags are accepted and ignored.
    let user = query
        .trim_start_matches("/W")
        .trim()
        .trim_end_matches('@')
        .to_owned();

    let cache_key = keys::finger(&user);
    if let Some(hit) = state.node.cache.get(&cache_key).await {
        return hit;
    }

    let style = &state.config.rendering.finger;
    let (fields, _) = state.profile_view(&state.config.owner, 1).await;
    let known_names = [
        fields.name.clone().unwrap_or_default().to_lowercase(),
        fields
            .display_name
            .clone()
            .unwrap_or_default()
            .to_lowercase(),
        state
            .config
            .owner
            .to_bech32()
            .unwrap_or_default()
            .to_lowercase(),
        state.config.owner.to_hex(),
    ];

    let bytes = if user.is_empty() || known_names.contains(&user.to_lowercase()) {
        build_plan(state, style).await.into_bytes()
    } else {
        format!("finger: {user}: no such user.\r\n").into_bytes()
    };

    state
        .node
        .cache
        .set(
            &cache_key,
            bytes.clone(),
            Duration::from_secs(state.config.caching.default_ttl_seconds.max(1)),
        )
        .await;
    bytes
}

async fn build_plan(state: &AppState, style: &nophr_config::RenderStyle) -> String {
    let opts = render_options(style);
    let width = style.max_line_length.max(40);
    let (fields, notes) = state
        .profile_view(&state.config.owner, style.recent_notes_count.max(1))
        .await;
    let npub = state
        .config
        .owner
        .to_bech32()
        .unwrap_or_else(|_| state.config.owner.to_hex());

    let mut out = String::new();
    out.push_str(&format!(
        "Login: {}\r\n",
        fields.best_name().unwrap_or(&state.config.site.operator)
    ));
    out.push_str(&format!("Nostr: {npub}\r\n"));
    if let Some(site) = &fields.website {
        out.push_str(&format!("Site: {site}\r\n"));
    }
    out.push_str("Plan:\r\n");

    let plan_body = match style.plan_source.as_deref() {
        Some("about") | None => fields.about.clone().unwrap_or_default(),
        Some(other) => other.to_owned(),
    };
    for line in nophr_render::wrap_text(&plan_body, width) {
        out.push_str(&line);
        out.push_str("\r\n");
    }

    if !notes.is_empty() {
        out.push_str("\r\nRecent notes:\r\n");
        for view in &notes {
            let rendered = event_to_plain(&view.event, view.interactions, &opts);
            for line in rendered.lines() {
                for wrapped in nophr_render::wrap_text(line, width) {
                    out.push_str(&wrapped);
                    out.push_str("\r\n");
                }
            }
            out.push_str("\r\n");
        }
    }
    out
}
