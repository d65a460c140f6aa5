// Built-in agent catalogue: names, capabilities, required integrations and system prompts.
use serde::Serialize;
use std::collections::BTreeMap;

pub const ORCHESTRATOR: &str = "orchestrator";
pub const FALLBACK_AGENT: &str = "research";

#[derive(Debug, Clone, Serialize)]
pub struct AgentSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub capabilities: &'static [&'static str],
    pub required_integrations: &'static [&'static str],
    #[serde(skip)]
    pub system_prompt: &'static str,
}

const AGENTS: &[AgentSpec] = &[
    AgentSpec {
        name: "research",
        description: "Conducts web research, gathers market data, and analyzes trends",
        capabilities: &[
            "web_scraping",
            "market_research",
            "trend_analysis",
            "data_gathering",
            "competitive_analysis",
        ],
        required_integrations: &[],
        system_prompt: "You are a research analyst. Gather relevant facts, market data and trends for the request. \
            Cite the kind of source each finding would come from and close with key takeaways.",
    },
    AgentSpec {
        name: "analysis",
        description: "Processes data, performs statistical analysis, and generates insights",
        capabilities: &[
            "data_processing",
            "statistical_analysis",
            "trend_analysis",
            "data_visualization",
            "insights_generation",
        ],
        required_integrations: &[],
        system_prompt: "You are a data analysis expert. Identify the metrics that matter, describe the analysis \
            you would run, and report insights with their confidence and caveats.",
    },
    AgentSpec {
        name: "content",
        description: "Creates blog posts, articles, copy, and SEO-optimized content",
        capabilities: &[
            "blog_writing",
            "article_creation",
            "copywriting",
            "seo_optimization",
            "content_strategy",
        ],
        required_integrations: &[],
        system_prompt: "You are an expert content writer. Produce engaging, well-structured content for the \
            target audience and include SEO suggestions at the end.",
    },
    AgentSpec {
        name: "social_media",
        description: "Manages social media posting, engagement, and analytics",
        capabilities: &[
            "twitter_posting",
            "telegram_management",
            "social_engagement",
            "content_scheduling",
            "analytics_tracking",
        ],
        required_integrations: &["twitter", "telegram"],
        system_prompt: "You are a social media manager. Draft platform-specific posts, a posting schedule and \
            the engagement metrics to track.",
    },
    AgentSpec {
        name: "graphics",
        description: "Generates images, posters, logos, and visual content",
        capabilities: &[
            "image_generation",
            "poster_creation",
            "logo_design",
            "social_media_graphics",
            "infographic_creation",
        ],
        required_integrations: &["stability_ai", "huggingface"],
        system_prompt: "You are a graphic design expert. Describe the visual concept, layout, palette and \
            typography, and write image-generation prompts for each asset.",
    },
    AgentSpec {
        name: "presentation",
        description: "Creates presentations, slide decks, and PDF documents",
        capabilities: &[
            "powerpoint_creation",
            "slide_design",
            "pdf_generation",
            "presentation_structure",
            "visual_storytelling",
        ],
        required_integrations: &[],
        system_prompt: "You are a presentation expert. Outline the deck slide by slide with titles, key points \
            and speaker notes.",
    },
    AgentSpec {
        name: "automation",
        description: "Automates workflows, integrates CRMs, and connects APIs",
        capabilities: &[
            "crm_integration",
            "workflow_automation",
            "api_integration",
            "data_synchronization",
            "process_automation",
        ],
        required_integrations: &["salesforce", "hubspot", "zapier", "webhook"],
        system_prompt: "You are an automation expert. Design the workflow as triggers, steps and integrations, \
            and list the data mapped between systems.",
    },
    AgentSpec {
        name: "reporting",
        description: "Builds dashboards, reports, and KPI tracking",
        capabilities: &[
            "dashboard_creation",
            "report_generation",
            "data_visualization",
            "kpi_tracking",
            "analytics_reporting",
        ],
        required_integrations: &[],
        system_prompt: "You are a business reporting specialist. Produce a structured report with an executive \
            summary, KPIs and recommended visualisations.",
    },
    AgentSpec {
        name: "customer_care",
        description: "Builds chatbots and automates customer support",
        capabilities: &[
            "chatbot_creation",
            "customer_support_automation",
            "faq_generation",
            "conversation_flow_design",
            "support_ticket_automation",
        ],
        required_integrations: &["rasa", "dialogflow", "telegram", "slack"],
        system_prompt: "You are a customer service expert. Design conversation flows, FAQ entries and escalation \
            rules for the support scenario.",
    },
    AgentSpec {
        name: "recommendation",
        description: "Provides strategic advice and decision support",
        capabilities: &[
            "strategic_planning",
            "decision_support",
            "business_analysis",
            "risk_assessment",
            "opportunity_identification",
        ],
        required_integrations: &[],
        system_prompt: "You are a strategy consultant. Weigh the options, assess risks and opportunities, and \
            give a prioritised recommendation.",
    },
    AgentSpec {
        name: ORCHESTRATOR,
        description: "Coordinates and delegates tasks to specialized agents",
        capabilities: &[
            "task_decomposition",
            "agent_delegation",
            "result_compilation",
            "workflow_management",
        ],
        required_integrations: &[],
        system_prompt: "You are a results compiler. Summarise the subtask results into one coherent answer with \
            key findings and next steps.",
    },
];

/// Prompt used to split a request into agent steps. The reply must be a JSON array.
pub const PLANNER_PROMPT: &str = "You are a task decomposition expert. Break the request into at most 5 steps, \
    each handled by one of these agents: research, analysis, content, social_media, graphics, presentation, \
    automation, reporting, customer_care, recommendation. Reply with JSON only: \
    [{\"agent\": \"<agent name>\", \"description\": \"<what to do>\"}]";

#[derive(Debug, Clone, Copy, Default)]
pub struct AgentRegistry;

impl AgentRegistry {
    pub fn new() -> Self {
        Self
    }

    pub fn all(&self) -> &'static [AgentSpec] {
        AGENTS
    }

    pub fn get(&self, name: &str) -> Option<&'static AgentSpec> {
        let cleaned = normalize_agent_name(name);
        AGENTS.iter().find(|agent| agent.name == cleaned)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn names(&self) -> Vec<&'static str> {
        AGENTS.iter().map(|agent| agent.name).collect()
    }

    pub fn capabilities(&self) -> BTreeMap<&'static str, &'static [&'static str]> {
        AGENTS
            .iter()
            .map(|agent| (agent.name, agent.capabilities))
            .collect()
    }

    pub fn find_by_capability(&self, capability: &str) -> Vec<&'static AgentSpec> {
        let cleaned = capability.trim();
        AGENTS
            .iter()
            .filter(|agent| agent.capabilities.iter().any(|item| *item == cleaned))
            .collect()
    }

    /// Agent used to run a task: explicit agent, then task type, then the orchestrator.
    pub fn resolve_for_task(
        &self,
        agent_name: Option<&str>,
        task_type: Option<&str>,
    ) -> &'static AgentSpec {
        agent_name
            .and_then(|name| self.get(name))
            .or_else(|| task_type.and_then(|name| self.get(name)))
            .or_else(|| self.get(ORCHESTRATOR))
            .unwrap_or(&AGENTS[0])
    }
}

pub fn normalize_agent_name(raw: &str) -> String {
    raw.trim().to_ascii_lowercase().replace(['-', ' '], "_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_lists_eleven_agents() {
        let registry = AgentRegistry::new();
        assert_eq!(registry.all().len(), 11);
        assert!(registry.contains("Social-Media"));
        assert!(!registry.contains("invalid_agent"));
        assert_eq!(registry.capabilities().len(), 11);
    }

    #[test]
    fn capability_lookup_spans_agents() {
        let registry = AgentRegistry::new();
        let names: Vec<&str> = registry
            .find_by_capability("trend_analysis")
            .iter()
            .map(|agent| agent.name)
            .collect();
        assert_eq!(names, vec!["research", "analysis"]);
    }

    #[test]
    fn task_resolution_falls_back_to_orchestrator() {
        let registry = AgentRegistry::new();
        assert_eq!(registry.resolve_for_task(Some("content"), None).name, "content");
        assert_eq!(
            registry.resolve_for_task(Some("unknown"), Some("reporting")).name,
            "reporting"
        );
        assert_eq!(registry.resolve_for_task(None, Some("general")).name, ORCHESTRATOR);
    }
}
