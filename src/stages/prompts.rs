//! Prompt templates for the five stages.
//!
//! Every prompt opens with a `## ROLE:` header naming the stage; per-chapter
//! prompts follow it with `## CHAPTER:`. Backends may rely on both headers.

use crate::context::ContextView;
use crate::model::{ChapterDraft, ChapterRange, ChapterSpec, QualityVerdict, StageKind};
use std::fmt::Write;

fn header(out: &mut String, stage: StageKind, chapter: Option<u32>) {
    let _ = writeln!(out, "## ROLE: {}", stage.as_str().to_uppercase());
    if let Some(chapter) = chapter {
        let _ = writeln!(out, "## CHAPTER: {}", chapter);
    }
    out.push('\n');
}

fn setting_section(out: &mut String, view: &ContextView) {
    let setting = &view.setting;
    let _ = writeln!(out, "## STORY");
    let _ = writeln!(out, "Title: {}", setting.title);
    let _ = writeln!(out, "Theme: {}", setting.theme);
    if !setting.genre.is_empty() {
        let _ = writeln!(out, "Genre: {}", setting.genre);
    }
    if !setting.world_rules.is_empty() {
        let _ = writeln!(out, "World rules:");
        for (key, rule) in &setting.world_rules {
            let _ = writeln!(out, "- {}: {}", key, rule);
        }
    }
    out.push('\n');

    let _ = writeln!(out, "## CHARACTERS");
    for c in &view.characters {
        let _ = write!(out, "- [{}] {} ({})", c.id, c.name, c.role);
        if !c.traits.is_empty() {
            let traits: Vec<&str> = c.traits.iter().map(String::as_str).collect();
            let _ = write!(out, "; traits: {}", traits.join(", "));
        }
        if !c.state.is_empty() {
            let _ = write!(out, "; now: {}", c.state);
        }
        out.push('\n');
    }
    out.push('\n');
}

fn story_so_far_section(out: &mut String, view: &ContextView) {
    let _ = writeln!(out, "## STORY SO FAR ({} words)", view.words_so_far);
    out.push_str(&view.story_so_far());
    out.push('\n');
}

fn chapter_section(out: &mut String, spec: &ChapterSpec) {
    let _ = writeln!(out, "## CHAPTER PLAN");
    let _ = writeln!(out, "Chapter {}: {}", spec.index, spec.title);
    let _ = writeln!(out, "Beat: {}", spec.beat);
    let _ = writeln!(out, "Length: {} words", spec.target_words);
    out.push('\n');
}

pub fn planner(premise: &str, target_words: u64, chapters: ChapterRange) -> String {
    let mut out = String::new();
    header(&mut out, StageKind::Planner, None);
    let _ = writeln!(out, "## PREMISE\n{}\n", premise.trim());
    let _ = write!(
        out,
        r#"## TASK
Design the setting for a novel of about {} words told in {} to {} chapters.
Respond with a single JSON object:
{{"title": "...", "theme": "...", "genre": "...",
  "world_rules": {{"rule name": "description"}},
  "characters": [{{"id": "slug", "name": "...", "role": "...", "traits": ["..."], "state": "where they start"}}]}}
"#,
        target_words, chapters.min, chapters.max
    );
    out
}

pub fn outliner(view: &ContextView, chapters: ChapterRange) -> String {
    let mut out = String::new();
    header(&mut out, StageKind::Outliner, None);
    setting_section(&mut out, view);
    let _ = write!(
        out,
        r#"## TASK
Outline the novel in {} to {} chapters totalling about {} words.
Respond with JSON: {{"chapters": [{{"title": "...", "summary": "what happens", "target_words": 2000}}]}}
"#,
        chapters.min, chapters.max, view.setting.target_words
    );
    out
}

pub fn writer(
    view: &ContextView,
    spec: &ChapterSpec,
    feedback: Option<&str>,
    attempt: u32,
) -> String {
    let mut out = String::new();
    header(&mut out, StageKind::Writer, Some(spec.index));
    setting_section(&mut out, view);
    story_so_far_section(&mut out, view);
    chapter_section(&mut out, spec);
    if let Some(feedback) = feedback.filter(|f| !f.trim().is_empty()) {
        let _ = writeln!(
            out,
            "## REVIEWER FEEDBACK (attempt {})\n{}\n",
            attempt,
            feedback.trim()
        );
    }
    let _ = writeln!(
        out,
        "## TASK\nWrite chapter {} in full prose, at least {} words, continuing coherently from the story so far. Output only the chapter text.",
        spec.index, spec.target_words.min
    );
    out
}

pub fn reviewer(view: &ContextView, spec: &ChapterSpec, draft: &ChapterDraft) -> String {
    let mut out = String::new();
    header(&mut out, StageKind::Reviewer, Some(spec.index));
    setting_section(&mut out, view);
    story_so_far_section(&mut out, view);
    chapter_section(&mut out, spec);
    let _ = writeln!(out, "## DRAFT ({} words)\n{}\n", draft.word_count, draft.text);
    out.push_str(
        r#"## TASK
Judge the draft. Score consistency with the setting, characters and earlier chapters, and coherence of the chapter itself, each from 0 to 1.
Respond with JSON: {"consistency": 0.0, "coherence": 0.0, "pass": true, "feedback": "what to fix"}
"#,
    );
    out
}

pub fn editor(
    view: &ContextView,
    spec: &ChapterSpec,
    draft: &ChapterDraft,
    verdict: &QualityVerdict,
) -> String {
    let mut out = String::new();
    header(&mut out, StageKind::Editor, Some(spec.index));
    setting_section(&mut out, view);
    chapter_section(&mut out, spec);
    let _ = writeln!(out, "## DRAFT\n{}\n", draft.text);
    if !verdict.feedback.is_empty() {
        let _ = writeln!(out, "## REVIEW NOTES\n{}\n", verdict.feedback);
    }
    out.push_str(
        r#"## TASK
Polish the draft without changing what happens. Output the final chapter text.
After the text, record each character whose situation changed as <character id="slug">new state</character>
and each plot-critical event as <event>one sentence</event>.
"#,
    );
    out
}
