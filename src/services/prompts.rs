//! Prompt text for every backend call of a storybook run.

use crate::core::continuity::ContinuityDirectives;
use crate::core::package::{Page, SceneDescription};
use crate::core::profile::Profile;

pub const DEFAULT_CAMERA_SHOT: &str =
    "medium (waist-up), eye-level, natural lens (~65mm), stable flattering perspective";

pub const NEGATIVE_PROMPT: &str = "identity drift, age change, plastic skin, uncanny valley, harsh shadows, blown highlights, \
excessive stylization, obscured face, cluttered background, watermark, text, logo";

/// Markdown headings the story prompt asks for, in order.
pub const STORY_SECTIONS: [&str; 6] = [
    "Title",
    "Vibe Check",
    "Summary",
    "Story",
    "Closing Message",
    "Reading Level",
];

pub fn story_system_prompt() -> String {
    format!(
        r#"You are a warm, imaginative children's author who writes personalized picture-book stories.
The child in the profile is always the hero of the story.

Guidelines:
- Weave the child's hobbies, favorite theme and personal notes into the plot naturally.
- Build toward the desired takeaway without preaching.
- Keep every recurring character consistent in name, look and personality.
- Use vivid, concrete scenes that an illustrator can draw, one moment at a time.
- Use child-safe, inclusive language only.
- Write in the requested story language.

Output format:
Respond in Markdown with these level-two headings, in this order: {}.
The "Story" section holds the full narrative as plain paragraphs, 450 to 900 words."#,
        STORY_SECTIONS.join(", ")
    )
}

pub fn story_user_prompt(profile: &Profile) -> String {
    let mut prompt = format!("Child profile:\n{}\n", profile.summary_for_prompt());
    if !profile.supporting_characters.is_empty() {
        prompt.push_str("\nRecurring characters:\n");
        for (name, details) in &profile.supporting_characters {
            prompt.push_str(&format!("- {}: {}\n", name, details));
        }
    }
    prompt.push_str("\nWrite the complete story now.");
    prompt
}

pub fn page_split_system_prompt(lower: u32, upper: u32) -> String {
    format!(
        r#"You are an award-winning children's book editor who structures stories into illustrated pages.
You receive a complete story and decide how to split it so each page supports a vivid illustration while preserving the full narrative.

Responsibilities:
- Keep chronological order. Every sentence of the story appears on exactly one page, verbatim.
- Never break a page in the middle of a sentence.
- Aim for {lower}-{upper} total pages; do not exceed the upper bound.
- Provide each page with a short, playful title highlighting the key moment.
- Keep text balanced so the story flows naturally when read page by page.

Output format:
Respond with valid JSON matching this schema:
{{
  "pages": [
    {{
      "page_number": 1,
      "title": "string, 3-7 words capturing the moment",
      "story_text": "string, the exact sentences for that page"
    }}
  ]
}}

Do not include commentary outside the JSON."#
    )
}

pub fn page_split_user_prompt(profile: &Profile, narrative: &str, desired_pages: u32) -> String {
    format!(
        "Child profile:\n{}\n\nDesired total pages: {}\n\nFull story to split:\n\"\"\"\n{}\n\"\"\"\n\nSplit the story according to the instructions.",
        profile.summary_for_prompt(),
        desired_pages,
        narrative
    )
}

pub fn scene_system_prompt() -> &'static str {
    r#"You are the art director of a children's picture book. For one page of the story you write a brief the illustrator can paint from.

Rules:
- Describe a single moment, what is visible and where the child is.
- Wardrobe must suit the moment; never describe the child's face, it comes from a reference photo.
- Mention recurring characters only when they appear on this page.
- Keep each field short and concrete.

Respond with valid JSON only:
{
  "scene_description": "one or two sentences describing the moment",
  "outfit_description": "what the child wears",
  "facial_expression": "the child's expression",
  "pose_description": "body language or action",
  "supporting_details": ["other characters or props on the page"],
  "mood": "one or two words",
  "setting": "short place description"
}"#
}

pub fn scene_user_prompt(page: &Page, profile: &Profile) -> String {
    let mut prompt = format!(
        "Child profile:\n{}\n\nPage {}",
        profile.summary_for_prompt(),
        page.page_number
    );
    if let Some(title) = &page.title {
        prompt.push_str(&format!(" - \"{}\"", title));
    }
    prompt.push_str(&format!(":\n{}\n", page.text));
    if !profile.supporting_characters.is_empty() {
        prompt.push_str("\nRecurring characters who may appear:\n");
        for (name, details) in &profile.supporting_characters {
            prompt.push_str(&format!("- {}: {}\n", name, details));
        }
    }
    prompt
}

pub const IDENTITY_SYSTEM_PROMPT: &str = "You are an illustration continuity director. \
Respond only with bullet points describing the child's inherent physical facial features (face, eyes, hair, skin, freckles). \
Never mention clothing, outfits, accessories, or props. \
Do not speculate about names, backstory, or personality.";

pub const IDENTITY_USER_PROMPT: &str = "Review the child in this reference portrait and produce a concise bullet list of immutable traits. \
Describe only physical facial characteristics such as face shape, skin tone, eye color, eyelashes, freckles, or hair color/texture. \
Do not mention clothing, outfits, accessories, or props. Limit to 6-8 bullets. Use the format '- detail'.";

/// Positive prompt for one page, combining the scene with continuity notes.
pub fn illustration_prompt(
    profile: &Profile,
    scene: &SceneDescription,
    directives: &ContinuityDirectives,
    camera_shot: Option<&str>,
) -> String {
    let shot = camera_shot
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(DEFAULT_CAMERA_SHOT);

    let mut prompt = format!(
        "TASK\nEdit the input photo(s) to create a high-definition storybook illustration of {}, while strictly preserving the child's facial identity and age.\n",
        profile.name
    );

    prompt.push_str(
        "\nIDENTITY LOCK (do not change)\n\
- Keep the same face shape, eye shape, nose, mouth, skin tone, hair color/style, and overall proportions as in the input image(s).\n\
- Maintain age and ethnicity exactly. Do not beautify, slim, or exaggerate features. No caricature.\n",
    );
    if let Some(notes) = &directives.identity_notes {
        prompt.push_str(notes);
        prompt.push('\n');
    }

    prompt.push_str(&format!(
        "\nSCENE (apply to background, wardrobe, pose as needed - do not alter the face)\n- {}\n",
        scene.description
    ));
    if let Some(outfit) = &scene.outfit {
        prompt.push_str(&format!("- Wardrobe: {}\n", outfit));
    }
    if let Some(expression) = &scene.facial_expression {
        prompt.push_str(&format!("- Expression: {}\n", expression));
    }
    if let Some(pose) = &scene.pose {
        prompt.push_str(&format!("- Pose: {}\n", pose));
    }
    for detail in &scene.supporting_details {
        prompt.push_str(&format!("- {}\n", detail));
    }
    if let Some(theme) = &profile.favorite_theme {
        prompt.push_str(&format!("- Theme: {}\n", theme));
    }
    prompt.push_str(
        "- Child remains the clear focal point; background supports the narrative without stealing focus.\n",
    );

    if !directives.supporting_character_notes.is_empty() {
        prompt.push_str("\nRECURRING CHARACTERS (keep their look consistent)\n");
        for note in &directives.supporting_character_notes {
            prompt.push_str(&format!("- {}\n", note));
        }
    }

    if !directives.static_notes.is_empty() {
        prompt.push_str("\nCONTINUITY\n");
        for note in &directives.static_notes {
            prompt.push_str(&format!("- {}\n", note));
        }
    }

    prompt.push_str(&format!(
        "\nART DIRECTION - Pixar/Disney-like 3D cinematic realism\n\
- Smooth but natural skin (not plastic), clean materials, stylized-real anatomy.\n\
- Vivid, balanced color palette; storybook ambience; gentle bokeh.\n\
- Camera: {}.\n\
\nLIGHTING & MOOD\n\
- Soft, radiant key light with warm rim light; believable soft shadowing.\n\
- {}\n\
\nRENDERING QUALITY\n\
- Ultra-sharp, print-ready detail; no real-world logos or text.\n\
- Composition keeps the child's face readable and instantly recognizable.",
        shot,
        scene
            .mood
            .as_deref()
            .map(|mood| format!("Mood: {}.", mood))
            .unwrap_or_else(|| "Wholesome, uplifting, imaginative mood.".to_string())
    ));
    prompt
}

/// Remove a surrounding Markdown code fence, with or without a language tag.
pub fn strip_code_blocks(s: &str) -> String {
    let s = s.trim();
    if !s.starts_with("```") {
        return s.to_string();
    }
    let body = s.trim_start_matches('`');
    let body = match body.split_once('\n') {
        Some((tag, rest)) if !tag.trim().contains(' ') => rest,
        _ => body,
    };
    body.trim_end().trim_end_matches("```").trim().to_string()
}
