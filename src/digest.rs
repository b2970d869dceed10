// src/digest.rs
//! Ordering articles into sections.

use crate::model::{Article, ArticleType, DigestSection, BRIEF_SECTION};

/// Group `articles` by section: configured sections first in their order,
/// then any others in first-seen order, with the brief section last.
/// Inside a section, non-briefs come before briefs and the generation order
/// is otherwise kept.
pub fn assemble_sections(articles: Vec<Article>, order: &[String]) -> Vec<DigestSection> {
    let mut sections: Vec<DigestSection> = Vec::new();
    let position = |name: &str, sections: &[DigestSection]| {
        sections
            .iter()
            .position(|s| s.name.eq_ignore_ascii_case(name))
    };

    for article in articles {
        match position(&article.section, &sections) {
            Some(i) => sections[i].articles.push(article),
            None => sections.push(DigestSection {
                name: article.section.clone(),
                articles: vec![article],
            }),
        }
    }

    let rank = |name: &str| -> (usize, usize) {
        if name.eq_ignore_ascii_case(BRIEF_SECTION) {
            return (2, 0);
        }
        match order.iter().position(|o| o.eq_ignore_ascii_case(name)) {
            Some(i) => (0, i),
            None => (1, 0),
        }
    };
    // Stable sort keeps first-seen order for unconfigured sections.
    sections.sort_by_key(|s| rank(&s.name));
    for s in &mut sections {
        s.articles
            .sort_by_key(|a| a.article_type == ArticleType::Brief);
    }
    sections
}
