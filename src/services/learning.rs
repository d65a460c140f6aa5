// Feedback learning: turns task ratings into agent memories the agent can recall later.
use crate::storage::{AgentMemoryRecord, FeedbackRecord, StorageBackend, TaskRecord};
use anyhow::Result;
use serde_json::json;

const BASE_CONFIDENCE: f64 = 0.5;
const NEGATIVE_BOOST: f64 = 0.2;
const LEARNING_RELEVANCE: f64 = 0.9;
const HIGH_CONFIDENCE_FEEDBACK: usize = 3;

#[derive(Debug, Clone, PartialEq)]
pub struct FeedbackInsights {
    pub sentiment: &'static str,
    pub priority: &'static str,
    pub improvement_areas: Vec<&'static str>,
}

impl FeedbackInsights {
    pub fn from_rating(rating: i64) -> Self {
        let sentiment = match rating {
            r if r >= 4 => "positive",
            r if r <= 2 => "negative",
            _ => "neutral",
        };
        let priority = match rating {
            r if r <= 2 => "high",
            3 => "medium",
            _ => "low",
        };
        let improvement_areas = if rating < 4 {
            vec!["general_improvement"]
        } else {
            Vec::new()
        };
        Self {
            sentiment,
            priority,
            improvement_areas,
        }
    }

    /// Priority weight scaled by confidence; negative sentiment adds a fixed boost.
    pub fn relevance(&self) -> f64 {
        let weight = match self.priority {
            "high" => 1.0,
            "medium" => 0.7,
            _ => 0.4,
        };
        let boost = if self.sentiment == "negative" {
            NEGATIVE_BOOST
        } else {
            0.0
        };
        (BASE_CONFIDENCE * weight + boost).min(1.0)
    }
}

/// Stores a `feedback` memory for the rating and a `learning` memory summarising every rating
/// the task has received so far. Returns the stored rows.
pub fn learn_from_feedback(
    storage: &dyn StorageBackend,
    task: &TaskRecord,
    agent: &str,
    feedback: &FeedbackRecord,
    now: f64,
) -> Result<Vec<AgentMemoryRecord>> {
    let insights = FeedbackInsights::from_rating(feedback.rating);
    let mut feedback_memory = AgentMemoryRecord {
        id: 0,
        agent_name: agent.to_string(),
        memory_type: "feedback".to_string(),
        content: json!({
            "task_id": task.id,
            "title": task.title,
            "rating": feedback.rating,
            "comment": feedback.comment,
            "feedback_type": feedback.feedback_type,
            "sentiment": insights.sentiment,
            "priority": insights.priority,
            "improvement_areas": insights.improvement_areas,
        }),
        context_tags: vec![
            "feedback".to_string(),
            "user_input".to_string(),
            agent.to_string(),
            format!("task:{}", task.id),
        ],
        relevance_score: insights.relevance(),
        access_count: 0,
        created_at: now,
        accessed_at: None,
    };
    feedback_memory.id = storage.insert_agent_memory(&feedback_memory)?;

    let history = storage.list_feedback_by_task(task.id)?;
    let mut learning_memory = learning_record(task, agent, &history, now);
    learning_memory.id = storage.insert_agent_memory(&learning_memory)?;
    Ok(vec![feedback_memory, learning_memory])
}

fn learning_record(
    task: &TaskRecord,
    agent: &str,
    history: &[FeedbackRecord],
    now: f64,
) -> AgentMemoryRecord {
    let count = history.len();
    let average = if count > 0 {
        history.iter().map(|item| item.rating as f64).sum::<f64>() / count as f64
    } else {
        0.0
    };
    let overall = FeedbackInsights::from_rating(average.round() as i64);
    let comments: Vec<&str> = history
        .iter()
        .filter_map(|item| item.comment.as_deref())
        .collect();
    AgentMemoryRecord {
        id: 0,
        agent_name: agent.to_string(),
        memory_type: "learning".to_string(),
        content: json!({
            "task_id": task.id,
            "feedback_count": count,
            "average_rating": average,
            "sentiment": overall.sentiment,
            "improvement_areas": overall.improvement_areas,
            "comments": comments,
            "confidence": if count >= HIGH_CONFIDENCE_FEEDBACK { "high" } else { "medium" },
        }),
        context_tags: vec![
            "learning".to_string(),
            "insights".to_string(),
            "improvement".to_string(),
            format!("task:{}", task.id),
        ],
        relevance_score: LEARNING_RELEVANCE,
        access_count: 0,
        created_at: now,
        accessed_at: None,
    }
}
