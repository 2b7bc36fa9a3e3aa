//! XMLTV EPG generation.
//!
//! The guide is a pure projection of the lineup and the anchor-driven
//! programme windows; programme ordering and timing are never computed here.
//! Invalid programmes (empty title, overlap) are suppressed and counted, and
//! dead-air gaps are omitted rather than emitted as silence.

use chrono::{DateTime, Utc};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use std::io::Cursor;

use exstreamtv_core::metrics;
use exstreamtv_core::models::FillerKind;
use exstreamtv_core::playout::Programme;

use crate::lineup::LineupEntry;

/// Maximum description length carried into the guide.
const MAX_DESCRIPTION: usize = 500;

/// Format a timestamp in XMLTV form: "YYYYMMDDHHmmss +0000".
#[must_use]
pub fn format_xmltv_datetime(dt: DateTime<Utc>) -> String {
    dt.format("%Y%m%d%H%M%S +0000").to_string()
}

/// Per-channel input: the lineup entry plus its programme window.
pub struct ChannelGuide<'a> {
    pub entry: &'a LineupEntry,
    pub programmes: Vec<Programme>,
}

/// Render the full XMLTV document.
pub fn render_xmltv(guides: &[ChannelGuide<'_>]) -> Result<String, quick_xml::Error> {
    let timer = metrics::epg::EPG_GENERATION_SECONDS.start_timer();

    let estimated = 256 + guides.len() * 200 + guides.iter().map(|g| g.programmes.len() * 300).sum::<usize>();
    let mut writer = Writer::new(Cursor::new(Vec::with_capacity(estimated)));

    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
    writer.write_event(Event::Text(BytesText::new("\n")))?;

    let mut tv = BytesStart::new("tv");
    tv.push_attribute(("generator-info-name", "EXStreamTV"));
    writer.write_event(Event::Start(tv))?;

    for guide in guides {
        let mut channel = BytesStart::new("channel");
        channel.push_attribute(("id", guide.entry.guide_id.as_str()));
        writer.write_event(Event::Start(channel))?;

        writer.write_event(Event::Start(BytesStart::new("display-name")))?;
        writer.write_event(Event::Text(BytesText::new(&guide.entry.channel.name)))?;
        writer.write_event(Event::End(BytesEnd::new("display-name")))?;

        writer.write_event(Event::End(BytesEnd::new("channel")))?;
    }

    for guide in guides {
        write_programmes(&mut writer, guide)?;
    }

    writer.write_event(Event::End(BytesEnd::new("tv")))?;
    timer.observe_duration();

    let bytes = writer.into_inner().into_inner();
    Ok(String::from_utf8(bytes).unwrap_or_default())
}

fn write_programmes(
    writer: &mut Writer<Cursor<Vec<u8>>>,
    guide: &ChannelGuide<'_>,
) -> Result<(), quick_xml::Error> {
    let channel_id = &guide.entry.guide_id;
    let channel_label = guide.entry.channel.id.as_str();
    let mut last_stop: Option<DateTime<Utc>> = None;

    for programme in &guide.programmes {
        // Dead air is omitted from the guide, not rendered as silence.
        if programme.item.filler_kind == FillerKind::DeadAir {
            metrics::epg::EPG_GAP_OMITTED_TOTAL
                .with_label_values(&[channel_label])
                .inc();
            continue;
        }
        if programme.item.title.trim().is_empty() {
            metrics::epg::EPG_VALIDATION_ERRORS_TOTAL
                .with_label_values(&["empty_title"])
                .inc();
            continue;
        }
        if last_stop.is_some_and(|stop| programme.start < stop) {
            metrics::epg::EPG_VALIDATION_ERRORS_TOTAL
                .with_label_values(&["overlap"])
                .inc();
            continue;
        }
        if programme.stop <= programme.start {
            metrics::epg::EPG_VALIDATION_ERRORS_TOTAL
                .with_label_values(&["non_positive_duration"])
                .inc();
            continue;
        }
        last_stop = Some(programme.stop);

        let mut tag = BytesStart::new("programme");
        tag.push_attribute(("start", format_xmltv_datetime(programme.start).as_str()));
        tag.push_attribute(("stop", format_xmltv_datetime(programme.stop).as_str()));
        tag.push_attribute(("channel", channel_id.as_str()));
        writer.write_event(Event::Start(tag))?;

        writer.write_event(Event::Start(BytesStart::new("title")))?;
        writer.write_event(Event::Text(BytesText::new(&programme.item.title)))?;
        writer.write_event(Event::End(BytesEnd::new("title")))?;

        if let Some(description) = &programme.item.description {
            let capped: String = description.chars().take(MAX_DESCRIPTION).collect();
            writer.write_event(Event::Start(BytesStart::new("desc")))?;
            writer.write_event(Event::Text(BytesText::new(&capped)))?;
            writer.write_event(Event::End(BytesEnd::new("desc")))?;
        }

        if let Some(episode) = &programme.item.episode {
            let mut ep = BytesStart::new("episode-num");
            ep.push_attribute(("system", "onscreen"));
            writer.write_event(Event::Start(ep))?;
            writer.write_event(Event::Text(BytesText::new(episode)))?;
            writer.write_event(Event::End(BytesEnd::new("episode-num")))?;
        }

        writer.write_event(Event::End(BytesEnd::new("programme")))?;
    }
    Ok(())
}
