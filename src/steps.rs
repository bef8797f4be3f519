use crate::schema::{StepTool, StepType, WorkflowStep, MAX_STEPS};

pub const DEFAULT_PROMPT_TEMPLATE: &str =
    "Produce the final result using these inputs:\n{{source_text}}";

/// Re-establishes the step-list invariants after an external edit.
///
/// Output guarantees for any non-empty input: at most six steps, orders
/// `1..=len`, exactly one generation step, at least one approval step.
/// Applying it twice yields the same list.
pub fn normalize_steps(mut steps: Vec<WorkflowStep>) -> Vec<WorkflowStep> {
    // Vec::sort_by_key is stable, so equal orders keep their input order.
    steps.sort_by_key(|step| step.order);
    steps.truncate(MAX_STEPS);

    for (index, step) in steps.iter_mut().enumerate() {
        let order = index as u32 + 1;
        step.order = order;
        if step.id.trim().is_empty() {
            step.id = format!("step_{order}");
        }
    }

    if steps.is_empty() {
        return steps;
    }

    if !steps.iter().any(|step| step.requires_approval) {
        let checkpoint = steps.len().saturating_sub(2);
        steps[checkpoint].requires_approval = true;
        steps[checkpoint].step_type = StepType::Condition;
    }

    let generation_count = steps.iter().filter(|step| step.is_generation()).count();
    if generation_count == 0 {
        if let Some(last) = steps.last_mut() {
            last.tool = StepTool::Generation;
            last.step_type = StepType::Output;
        }
    } else if generation_count > 1 {
        let mut seen_generation = false;
        for step in steps.iter_mut().filter(|step| step.is_generation()) {
            if seen_generation {
                step.tool = StepTool::Simulated;
                step.prompt_template = None;
            }
            seen_generation = true;
        }
    }

    if let Some(generation) = steps.iter_mut().find(|step| step.is_generation()) {
        let has_template = generation
            .prompt_template
            .as_deref()
            .map(|t| !t.trim().is_empty())
            .unwrap_or(false);
        if !has_template {
            generation.prompt_template = Some(DEFAULT_PROMPT_TEMPLATE.to_string());
        }
    }

    steps
}
