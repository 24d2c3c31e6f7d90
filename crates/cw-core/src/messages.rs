//! Outbound notification messages handed to the messaging collaborator.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Candidate, Initiative};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryEntry {
    pub name: String,
    pub match_percentage: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageKind {
    CandidateMatch { match_percentage: i64 },
    /// Entries are kept in selection order.
    LeadSummary { entries: Vec<SummaryEntry> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub project_id: Uuid,
    pub project_title: String,
    pub sender_id: Uuid,
    pub recipient_id: Uuid,
    pub kind: MessageKind,
}

impl OutboundMessage {
    pub fn candidate_match(project: &Initiative, candidate: &Candidate, sender_id: Uuid) -> Self {
        Self {
            project_id: project.id,
            project_title: project.title.clone(),
            sender_id,
            recipient_id: candidate.user_id,
            kind: MessageKind::CandidateMatch {
                match_percentage: candidate.match_percentage(),
            },
        }
    }

    pub fn lead_summary(
        project: &Initiative,
        recipient_id: Uuid,
        candidates: &[Candidate],
        sender_id: Uuid,
    ) -> Self {
        let entries = candidates
            .iter()
            .map(|c| SummaryEntry {
                name: c.name.clone(),
                match_percentage: c.match_percentage(),
            })
            .collect();
        Self {
            project_id: project.id,
            project_title: project.title.clone(),
            sender_id,
            recipient_id,
            kind: MessageKind::LeadSummary { entries },
        }
    }

    pub fn body(&self) -> String {
        match &self.kind {
            MessageKind::CandidateMatch { match_percentage } => format!(
                "You're a top match for \"{}\"!\n\nYour skills align {}% with this project's needs.\n\nCheck out the project details and apply if you're interested in contributing!",
                self.project_title, match_percentage
            ),
            MessageKind::LeadSummary { entries } => {
                let list = entries
                    .iter()
                    .map(|e| format!("- {} ({}% match)", e.name, e.match_percentage))
                    .collect::<Vec<_>>()
                    .join("\n");
                format!(
                    "Top {} Candidate Matches for \"{}\"\n\nThe matching system has identified these volunteers:\n\n{}\n\nThese candidates have been notified about the project opportunity.",
                    entries.len(),
                    self.project_title,
                    list
                )
            }
        }
    }
}
