//! Mechanical structure building: topic groups and store statistics.
//!
//! No remote calls. Units are grouped under each of their topics, or under
//! their area when they have no topics. Units with neither stay ungrouped.
//! People and area profiles are derived from the same snapshot.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use tracing::{debug, instrument};

use kbforge_shared::{
    Aggregation, ContributionCounts, KnowledgeUnit, Result, Statistics, StoreSnapshot, TopicGroup,
    UnitId, UnitKind,
};

use crate::agents::Aggregator;

/// Default [`Aggregator`]. Deterministic for a given snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct StructureAggregator;

#[async_trait]
impl Aggregator for StructureAggregator {
    async fn aggregate(&self, snapshot: &StoreSnapshot, _instructions: &[String]) -> Result<Aggregation> {
        Ok(build_aggregation(snapshot))
    }
}

#[instrument(skip_all, fields(units = snapshot.len()))]
pub fn build_aggregation(snapshot: &StoreSnapshot) -> Aggregation {
    let aggregation = Aggregation {
        statistics: compute_statistics(snapshot),
        topics: group_topics(snapshot),
    };
    debug!(topics = aggregation.topics.len(), "aggregation built");
    aggregation
}

pub fn compute_statistics(snapshot: &StoreSnapshot) -> Statistics {
    let answered = snapshot.questions.iter().filter(|q| q.answered).count();
    let mut stats = Statistics {
        questions: snapshot.questions.len(),
        answers: snapshot.answers.len(),
        notes: snapshot.notes.len(),
        answered_questions: answered,
        unanswered_questions: snapshot.questions.len() - answered,
        ..Default::default()
    };

    for unit in snapshot.units() {
        let author = author_of(unit);
        let counts: &mut ContributionCounts = stats.contributors.entry(author.to_string()).or_default();
        match unit.kind() {
            UnitKind::Question => counts.questions += 1,
            UnitKind::Answer => counts.answers += 1,
            UnitKind::Note => counts.notes += 1,
        }

        if let Some(area) = &unit.area {
            *stats.areas.entry(area.clone()).or_default() += 1;
        }
        for topic in &unit.topics {
            *stats.topics.entry(topic.clone()).or_default() += 1;
        }
        *stats.sources.entry(unit.source.clone()).or_default() += 1;

        if let Some(day) = unit.date.as_deref().and_then(day_of) {
            *stats.activity.entry(day.to_string()).or_default() += 1;
        }
    }

    stats
}

fn author_of(unit: &KnowledgeUnit) -> &str {
    match unit.author.trim() {
        "" => "unknown",
        author => author,
    }
}

/// `YYYY-MM-DD` prefix of a date string, if it has one.
fn day_of(date: &str) -> Option<&str> {
    let day = date.trim().get(..10)?;
    chrono::NaiveDate::parse_from_str(day, "%Y-%m-%d").ok()?;
    Some(day)
}

/// Topic groups keyed and sorted by slug. The first spelling seen names the group.
pub fn group_topics(snapshot: &StoreSnapshot) -> Vec<TopicGroup> {
    let mut groups: BTreeMap<String, TopicGroup> = BTreeMap::new();

    for unit in snapshot.units() {
        for name in group_names(unit) {
            let slug = slugify(name);
            let group = groups.entry(slug.clone()).or_insert_with(|| TopicGroup {
                name: name.to_string(),
                slug,
                ..Default::default()
            });
            let ids = match unit.kind() {
                UnitKind::Question => &mut group.questions,
                UnitKind::Answer => &mut group.answers,
                UnitKind::Note => &mut group.notes,
            };
            if !ids.contains(&unit.id) {
                ids.push(unit.id);
            }
        }
    }

    let mut groups: Vec<TopicGroup> = groups.into_values().collect();
    for group in &mut groups {
        group.questions.sort();
        group.answers.sort();
        group.notes.sort();
    }
    groups
}

fn group_names(unit: &KnowledgeUnit) -> Vec<&str> {
    let topics: Vec<&str> = unit
        .topics
        .iter()
        .map(|t| t.trim())
        .filter(|t| !t.is_empty())
        .collect();
    if !topics.is_empty() {
        return topics;
    }
    unit.area
        .as_deref()
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .into_iter()
        .collect()
}

/// Unit ids split by kind, each list sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnitRefs {
    pub questions: Vec<UnitId>,
    pub answers: Vec<UnitId>,
    pub notes: Vec<UnitId>,
}

impl UnitRefs {
    fn push(&mut self, id: UnitId) {
        let ids = match id.kind {
            UnitKind::Question => &mut self.questions,
            UnitKind::Answer => &mut self.answers,
            UnitKind::Note => &mut self.notes,
        };
        if !ids.contains(&id) {
            ids.push(id);
        }
    }

    fn sort(&mut self) {
        self.questions.sort();
        self.answers.sort();
        self.notes.sort();
    }

    pub fn total(&self) -> usize {
        self.questions.len() + self.answers.len() + self.notes.len()
    }
}

/// Everything one contributor wrote.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersonProfile {
    pub name: String,
    pub slug: String,
    pub units: UnitRefs,
    pub areas: BTreeSet<String>,
    pub topics: BTreeSet<String>,
}

/// Units filed under one area, with who wrote them and what they cover.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AreaProfile {
    pub name: String,
    pub slug: String,
    pub units: UnitRefs,
    pub contributors: BTreeSet<String>,
    pub topics: BTreeSet<String>,
}

/// Contributor profiles keyed and sorted by slug. Units without an author
/// belong to `unknown`.
pub fn group_people(snapshot: &StoreSnapshot) -> Vec<PersonProfile> {
    let mut people: BTreeMap<String, PersonProfile> = BTreeMap::new();
    for unit in snapshot.units() {
        let name = author_of(unit);
        let slug = slugify_or(name, "person");
        let person = people.entry(slug.clone()).or_insert_with(|| PersonProfile {
            name: name.to_string(),
            slug,
            ..Default::default()
        });
        person.units.push(unit.id);
        if let Some(area) = unit.area.as_deref().map(str::trim).filter(|a| !a.is_empty()) {
            person.areas.insert(area.to_string());
        }
        person.topics.extend(clean_topics(unit).map(String::from));
    }
    let mut people: Vec<PersonProfile> = people.into_values().collect();
    people.iter_mut().for_each(|p| p.units.sort());
    people
}

/// Area profiles keyed and sorted by slug. Units without an area are left out.
pub fn group_areas(snapshot: &StoreSnapshot) -> Vec<AreaProfile> {
    let mut areas: BTreeMap<String, AreaProfile> = BTreeMap::new();
    for unit in snapshot.units() {
        let Some(name) = unit.area.as_deref().map(str::trim).filter(|a| !a.is_empty()) else {
            continue;
        };
        let slug = slugify_or(name, "area");
        let area = areas.entry(slug.clone()).or_insert_with(|| AreaProfile {
            name: name.to_string(),
            slug,
            ..Default::default()
        });
        area.units.push(unit.id);
        area.contributors.insert(author_of(unit).to_string());
        area.topics.extend(clean_topics(unit).map(String::from));
    }
    let mut areas: Vec<AreaProfile> = areas.into_values().collect();
    areas.iter_mut().for_each(|a| a.units.sort());
    areas
}

fn clean_topics(unit: &KnowledgeUnit) -> impl Iterator<Item = &str> {
    unit.topics.iter().map(|t| t.trim()).filter(|t| !t.is_empty())
}

/// Lowercase kebab-case file stem. Never empty.
pub fn slugify(name: &str) -> String {
    slugify_or(name, "topic")
}

/// [`slugify`] with the stem to use when `name` has no alphanumerics.
///
/// The result only holds lowercase alphanumerics and `-`, so it is always a
/// single safe path component.
pub fn slugify_or(name: &str, fallback: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_dash = false;

    for c in name.chars() {
        if c.is_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.extend(c.to_lowercase());
        } else {
            pending_dash = true;
        }
    }

    if slug.is_empty() {
        fallback.to_string()
    } else {
        slug
    }
}
