//! Derived index files: `stats/statistics.json`, `topics/<slug>.md`,
//! `people/<slug>.md`, `areas/<slug>.md` and `INDEX.md`.
//!
//! Every write goes through the [`StagingRecord`] so a failed run restores
//! the previous indices. Files are written to a temp name and renamed into place.

use std::collections::{BTreeSet, HashMap};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use tracing::{debug, info, instrument};

use kbforge_shared::{Aggregation, KbError, KnowledgeUnit, Result, StoreSnapshot, TopicGroup, UnitId};
use kbforge_store::StoreLayout;

use crate::aggregate::{
    AreaProfile, PersonProfile, UnitRefs, group_areas, group_people, slugify, slugify_or,
};
use crate::staging::{StagedChange, StagingRecord};

const STATISTICS_FILE: &str = "statistics.json";

/// Title length shown next to each unit link.
const TITLE_MAX_CHARS: usize = 80;

/// How many pages of each kind [`write_indices`] left on disk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexSummary {
    pub topics: usize,
    pub people: usize,
    pub areas: usize,
}

type UnitsById<'a> = HashMap<UnitId, &'a KnowledgeUnit>;

/// Write every derived index for `aggregation`. Pages whose group no longer
/// exists are removed.
#[instrument(skip_all, fields(root = %layout.root().display(), topics = aggregation.topics.len()))]
pub fn write_indices(
    layout: &StoreLayout,
    aggregation: &Aggregation,
    snapshot: &StoreSnapshot,
    staging: &mut StagingRecord,
) -> Result<IndexSummary> {
    let units: UnitsById<'_> = snapshot.units().map(|u| (u.id, u)).collect();
    let people = group_people(snapshot);
    let areas = group_areas(snapshot);

    let stats_dir = layout.stats_dir();
    staging.create_dir_all(&stats_dir)?;
    let stats_json = serde_json::to_string_pretty(&aggregation.statistics)
        .map_err(|e| KbError::Store(format!("statistics serialization failed: {e}")))?;
    write_staged(&stats_dir.join(STATISTICS_FILE), &stats_json, staging)?;

    let summary = IndexSummary {
        topics: write_pages(
            &layout.topics_dir(),
            aggregation
                .topics
                .iter()
                .map(|group| (topic_stem(group), render_topic(group, &units))),
            staging,
        )?,
        people: write_pages(
            &layout.people_dir(),
            people.iter().map(|p| (p.slug.clone(), render_person(p, &units))),
            staging,
        )?,
        areas: write_pages(
            &layout.areas_dir(),
            areas.iter().map(|a| (a.slug.clone(), render_area(a, &units))),
            staging,
        )?,
    };

    write_staged(
        &layout.index_file(),
        &render_index(aggregation, &people, &areas),
        staging,
    )?;

    info!(
        topics = summary.topics,
        people = summary.people,
        areas = summary.areas,
        "derived indices written"
    );
    Ok(summary)
}

/// File stem for a topic page. Aggregators may hand back any slug, so it is
/// re-slugified into a single path component.
fn topic_stem(group: &TopicGroup) -> String {
    slugify(&group.slug)
}

/// Write one `<stem>.md` per page into `dir` and remove any other `.md`
/// file there. Returns the number of distinct pages.
fn write_pages(
    dir: &Path,
    pages: impl Iterator<Item = (String, String)>,
    staging: &mut StagingRecord,
) -> Result<usize> {
    staging.create_dir_all(dir)?;
    let mut live: BTreeSet<PathBuf> = BTreeSet::new();
    for (stem, content) in pages {
        let path = dir.join(format!("{stem}.md"));
        write_staged(&path, &content, staging)?;
        live.insert(path);
    }
    remove_stale(dir, &live, staging)?;
    Ok(live.len())
}

/// Write `content` to `path` unless it is already identical, staging the change.
fn write_staged(path: &Path, content: &str, staging: &mut StagingRecord) -> Result<()> {
    let previous = match std::fs::read_to_string(path) {
        Ok(existing) if existing == content => return Ok(()),
        Ok(existing) => Some(existing),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => return Err(KbError::io(path, e)),
    };

    let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or("index");
    let temp = path.with_file_name(format!(".{file_name}.tmp"));
    std::fs::write(&temp, content).map_err(|e| KbError::io(&temp, e))?;
    std::fs::rename(&temp, path).map_err(|e| KbError::io(path, e))?;

    match previous {
        Some(original) => staging.rewritten(path, original),
        None => staging.created(path),
    }
    debug!(path = %path.display(), size = content.len(), "wrote index file");
    Ok(())
}

fn remove_stale(dir: &Path, live: &BTreeSet<PathBuf>, staging: &mut StagingRecord) -> Result<()> {
    let entries = std::fs::read_dir(dir).map_err(|e| KbError::io(dir, e))?;
    for entry in entries {
        let path = entry.map_err(|e| KbError::io(dir, e))?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("md") || live.contains(&path) {
            continue;
        }
        let original = std::fs::read_to_string(&path).map_err(|e| KbError::io(&path, e))?;
        std::fs::remove_file(&path).map_err(|e| KbError::io(&path, e))?;
        staging.push(StagedChange::Removed {
            path: path.clone(),
            original,
        });
        debug!(path = %path.display(), "removed stale index page");
    }
    Ok(())
}

/// `## Questions` / `## Answers` / `## Notes` link lists, skipping empty ones.
fn render_unit_links(out: &mut String, refs: &UnitRefs, units: &UnitsById<'_>) {
    for (heading, ids) in [
        ("Questions", &refs.questions),
        ("Answers", &refs.answers),
        ("Notes", &refs.notes),
    ] {
        if ids.is_empty() {
            continue;
        }
        let _ = writeln!(out, "## {heading}\n");
        for id in ids {
            let unit = units.get(id);
            let title = unit.map(|u| title_of(&u.text)).unwrap_or_default();
            let marker = match unit {
                Some(u) if u.answered => " (answered)",
                _ => "",
            };
            let _ = writeln!(
                out,
                "- [{id}](../{}/{}){marker} {title}",
                id.kind.dir_name(),
                id.file_name()
            );
        }
        out.push('\n');
    }
}

fn topic_links(topics: &BTreeSet<String>) -> String {
    topics
        .iter()
        .map(|t| format!("[{t}](../topics/{}.md)", slugify(t)))
        .collect::<Vec<_>>()
        .join(", ")
}

fn render_topic(group: &TopicGroup, units: &UnitsById<'_>) -> String {
    let mut out = format!("# {}\n\n", group.name);
    if let Some(description) = group.description.as_deref().filter(|d| !d.trim().is_empty()) {
        out.push_str(description.trim());
        out.push_str("\n\n");
    }
    let refs = UnitRefs {
        questions: group.questions.clone(),
        answers: group.answers.clone(),
        notes: group.notes.clone(),
    };
    render_unit_links(&mut out, &refs, units);
    out
}

fn render_person(person: &PersonProfile, units: &UnitsById<'_>) -> String {
    let mut out = format!("# {}\n\n", person.name);
    let _ = writeln!(out, "- **Questions**: {}", person.units.questions.len());
    let _ = writeln!(out, "- **Answers**: {}", person.units.answers.len());
    let _ = writeln!(out, "- **Notes**: {}", person.units.notes.len());
    if !person.areas.is_empty() {
        let areas: Vec<String> = person
            .areas
            .iter()
            .map(|a| format!("[{a}](../areas/{}.md)", slugify_or(a, "area")))
            .collect();
        let _ = writeln!(out, "- **Areas**: {}", areas.join(", "));
    }
    if !person.topics.is_empty() {
        let _ = writeln!(out, "- **Topics**: {}", topic_links(&person.topics));
    }
    out.push('\n');
    render_unit_links(&mut out, &person.units, units);
    out
}

fn render_area(area: &AreaProfile, units: &UnitsById<'_>) -> String {
    let mut out = format!("# {}\n\n", area.name);
    let contributors: Vec<String> = area
        .contributors
        .iter()
        .map(|c| format!("[{c}](../people/{}.md)", slugify_or(c, "person")))
        .collect();
    let _ = writeln!(out, "- **Contributors**: {}", contributors.join(", "));
    if !area.topics.is_empty() {
        let _ = writeln!(out, "- **Topics**: {}", topic_links(&area.topics));
    }
    out.push('\n');
    render_unit_links(&mut out, &area.units, units);
    out
}

fn render_index(aggregation: &Aggregation, people: &[PersonProfile], areas: &[AreaProfile]) -> String {
    let stats = &aggregation.statistics;
    let mut out = String::from("# Knowledge Base Index\n\n## Statistics\n\n");
    let _ = writeln!(out, "- **Topics**: {}", aggregation.topics.len());
    let _ = writeln!(
        out,
        "- **Questions**: {} ({} answered, {} open)",
        stats.questions, stats.answered_questions, stats.unanswered_questions
    );
    let _ = writeln!(out, "- **Answers**: {}", stats.answers);
    let _ = writeln!(out, "- **Notes**: {}", stats.notes);
    let _ = writeln!(out, "- **Contributors**: {}", stats.contributors.len());
    let _ = writeln!(out, "- **Sources**: {}", stats.sources.len());

    if !aggregation.topics.is_empty() {
        out.push_str("\n## Topics\n\n| Topic | Questions | Answers | Notes | Total |\n");
        out.push_str("|-------|-----------|---------|-------|-------|\n");
        let mut topics: Vec<&TopicGroup> = aggregation.topics.iter().collect();
        topics.sort_by(|a, b| b.total().cmp(&a.total()).then_with(|| a.slug.cmp(&b.slug)));
        for group in topics {
            let _ = writeln!(
                out,
                "| [{}](topics/{}.md) | {} | {} | {} | {} |",
                group.name,
                topic_stem(group),
                group.questions.len(),
                group.answers.len(),
                group.notes.len(),
                group.total()
            );
        }
    }

    if !areas.is_empty() {
        out.push_str("\n## Areas\n\n");
        for area in areas {
            let _ = writeln!(
                out,
                "- [{}](areas/{}.md): {} units, {} contributors",
                area.name,
                area.slug,
                area.units.total(),
                area.contributors.len()
            );
        }
    }

    if !people.is_empty() {
        out.push_str("\n## People\n\n");
        for person in people {
            let _ = writeln!(
                out,
                "- [{}](people/{}.md): {} questions, {} answers, {} notes",
                person.name,
                person.slug,
                person.units.questions.len(),
                person.units.answers.len(),
                person.units.notes.len()
            );
        }
    }

    if !stats.activity.is_empty() {
        out.push_str("\n## Recent Activity\n\n");
        for (day, count) in stats.activity.iter().rev().take(14) {
            let _ = writeln!(out, "- **{day}**: {count} contributions");
        }
    }
    out
}

fn title_of(text: &str) -> String {
    let line = text.lines().map(str::trim).find(|l| !l.is_empty()).unwrap_or_default();
    if line.chars().count() <= TITLE_MAX_CHARS {
        return line.to_string();
    }
    let cut: String = line.chars().take(TITLE_MAX_CHARS).collect();
    format!("{}…", cut.trim_end())
}
