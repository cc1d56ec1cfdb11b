use serde::Serialize;

use crate::session::{ConversationSummary, Exercise};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExerciseFilter {
    pub subject: Option<String>,
    pub concepts: Vec<String>,
    /// 0 means any level.
    pub level: u8,
}

/// One row of the conversation list, joined with its catalog entry.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SidebarEntry {
    pub id: String,
    pub exercise_id: String,
    pub title: String,
    pub concept: String,
    pub level: Option<u8>,
}

/// Case-insensitive match on title, concept or level. An empty query keeps everything.
pub fn quick_search<'a>(exercises: &'a [Exercise], query: &str) -> Vec<&'a Exercise> {
    let q = query.trim().to_lowercase();
    if q.is_empty() {
        return exercises.iter().collect();
    }
    exercises
        .iter()
        .filter(|e| {
            e.title.to_lowercase().contains(&q)
                || e.concept.to_lowercase().contains(&q)
                || e.level.to_string().contains(&q)
        })
        .collect()
}

pub fn filter_exercises<'a>(exercises: &'a [Exercise], filter: &ExerciseFilter) -> Vec<&'a Exercise> {
    exercises
        .iter()
        .filter(|e| filter.subject.as_deref().is_none_or(|s| s.is_empty() || e.subject == s))
        .filter(|e| filter.concepts.is_empty() || filter.concepts.contains(&e.concept))
        .filter(|e| filter.level == 0 || e.level == filter.level)
        .collect()
}

/// Subject, then concept, then level, then title.
pub fn sort_exercises(exercises: &mut [&Exercise]) {
    exercises.sort_by(|a, b| {
        a.subject
            .cmp(&b.subject)
            .then_with(|| a.concept.cmp(&b.concept))
            .then_with(|| a.level.cmp(&b.level))
            .then_with(|| a.title.cmp(&b.title))
    });
}

pub fn sidebar_entries(summaries: &[ConversationSummary], exercises: &[Exercise]) -> Vec<SidebarEntry> {
    summaries
        .iter()
        .map(|s| match exercises.iter().find(|e| e.id == s.exercise_id) {
            Some(e) => SidebarEntry {
                id: s.id.clone(),
                exercise_id: s.exercise_id.clone(),
                title: e.title.clone(),
                concept: e.concept.clone(),
                level: Some(e.level),
            },
            None => SidebarEntry {
                id: s.id.clone(),
                exercise_id: s.exercise_id.clone(),
                title: format!("Unknown exercise ({})", s.exercise_id),
                concept: "Unknown".into(),
                level: None,
            },
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(id: &str, title: &str, subject: &str, concept: &str, level: u8) -> Exercise {
        Exercise {
            id: id.into(),
            title: title.into(),
            subject: subject.into(),
            concept: concept.into(),
            level,
            statement: String::new(),
            image: None,
        }
    }

    fn catalog() -> Vec<Exercise> {
        vec![
            exercise("e1", "Ley de Ohm", "Circuitos", "resistencia", 2),
            exercise("e2", "Divisor de tension", "Circuitos", "tension", 3),
            exercise("e3", "Derivadas", "Calculo", "derivada", 1),
        ]
    }

    #[test]
    fn quick_search_matches_title_concept_and_level() {
        let all = catalog();
        let ids = |v: Vec<&Exercise>| v.iter().map(|e| e.id.clone()).collect::<Vec<_>>();
        assert_eq!(ids(quick_search(&all, "  ")), vec!["e1", "e2", "e3"]);
        assert_eq!(ids(quick_search(&all, "OHM")), vec!["e1"]);
        assert_eq!(ids(quick_search(&all, "tension")), vec!["e2"]);
        assert_eq!(ids(quick_search(&all, "3")), vec!["e2"]);
        assert!(quick_search(&all, "integral").is_empty());
    }

    #[test]
    fn filter_by_subject_concepts_and_level() {
        let all = catalog();
        let f = ExerciseFilter { subject: Some("Circuitos".into()), concepts: vec![], level: 0 };
        assert_eq!(filter_exercises(&all, &f).len(), 2);
        let f = ExerciseFilter { subject: None, concepts: vec!["derivada".into(), "tension".into()], level: 0 };
        assert_eq!(filter_exercises(&all, &f).len(), 2);
        let f = ExerciseFilter { subject: Some("Circuitos".into()), concepts: vec![], level: 3 };
        let hits = filter_exercises(&all, &f);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "e2");
    }

    #[test]
    fn sorted_by_subject_concept_level_title() {
        let all = catalog();
        let mut refs: Vec<&Exercise> = all.iter().collect();
        sort_exercises(&mut refs);
        let ids: Vec<_> = refs.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["e3", "e1", "e2"]);
    }

    #[test]
    fn sidebar_joins_known_and_unknown_exercises() {
        let all = catalog();
        let summaries = vec![
            ConversationSummary { id: "i1".into(), exercise_id: "e2".into(), created_at: None, updated_at: None },
            ConversationSummary { id: "i2".into(), exercise_id: "gone".into(), created_at: None, updated_at: None },
        ];
        let rows = sidebar_entries(&summaries, &all);
        assert_eq!(rows[0].title, "Divisor de tension");
        assert_eq!(rows[0].level, Some(3));
        assert_eq!(rows[1].title, "Unknown exercise (gone)");
        assert_eq!(rows[1].level, None);
    }
}
