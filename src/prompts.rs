//! Prompt texts sent to the completion service.

/// Built-in planner preamble, used when no prompt file is configured.
pub const DEFAULT_PLANNER_PREAMBLE: &str = r#"You are a planner that breaks a user request into steps executed by the agents listed below.
Respond with a single JSON object and nothing else.

When the request can be served by the agents, respond with:
{"ActionType": "Execute", "ExecutePlan": [
  {"Step": 1, "Agent name": "<agent>", "Agent payload": {<fields from the agent template>},
   "Status Message": "<short progress text shown to the user>",
   "dependency": [{"dependency_parameter": "<payload field>", "dependency_step": <earlier step>}]}
]}

Rules:
- Use only the agents listed below and only the payload fields in their templates.
- When a payload value comes from another step's result, leave it empty and declare a dependency on that step.
- Steps without dependencies may run in any order.
- Use the interactive agent, if one is listed, to relay a message to the user.

When you need more information from the user respond with:
{"ActionType": "ClarificationNeeded", "Message": "<question for the user>"}

When you can answer directly without any agent respond with:
{"ActionType": "UserMessage", "Message": "<answer>"}"#;

/// Separator around the date and user block of the planning prompt.
pub const PLANNER_SEPARATOR: &str = "###################";

/// Ask for one parameter's value out of a prior step's result.
pub fn extraction_prompt(parameter: &str) -> String {
    format!(
        "Your task is to identify the value of '{p}' from the below provided content. \
         Don't return any other information other than the value of '{p}'. \
         If you can't find the value of '{p}', please return 'not_found'.",
        p = parameter
    )
}

/// Sentinel returned by the extraction prompt when the value is absent.
pub const NOT_FOUND_SENTINEL: &str = "not_found";

/// Combine the results of independent steps into one answer.
pub fn merge_prompt(query: &str) -> String {
    format!(
        "Your task is to review the multi-step response to the question {} from the below provided content. \
         Don't return any other information other than what is mentioned in the below content. \
         Your job is to combine these multi-step responses into a single, easy-to-read response. \
         The output must be a JSON object that contains three attributes TextResponse and AssociatedImageLink \
         and AssociatedVideoLink. Do not include ```json and simply output the JSON object only. \
         The output must be only a JSON object and nothing else.",
        query
    )
}

/// Recognise housekeeping commands.
pub const COMMAND_PROMPT: &str = r#"You classify a chat message as one of the following commands.
Reply with exactly one of these lowercase values and nothing else:
- new session: the user wants to start a new session
- new topic: the user wants to change the subject and start over
- forget me: the user wants their chat history deleted
- create support ticket: the user wants to open a support ticket
- feedbackpositive: the message is only praise or thanks for the previous answer
- feedbacknegative: the message is only a complaint about the previous answer
- set context hr, set context finance, set context sales, set context judiciary, set context procurement: the user sets the business function context
- notfound: anything else, including every real question"#;
