// Prompt constants for résumé field extraction.

/// System prompt fragment that enforces JSON-only output.
pub const JSON_ONLY_SYSTEM: &str = "You are a precise, structured assistant. \
    You MUST respond with valid JSON only. \
    Do NOT include any text outside the JSON object. \
    Do NOT use markdown code fences. \
    Do NOT include explanations or apologies.";

/// Extraction prompt. `{resume_text}` is replaced with the document text.
pub const RESUME_EXTRACTION_PROMPT: &str = "\
Extract the candidate information from the résumé below and return a single JSON object \
with exactly these keys:

{
  \"contactInfo\": { \"name\": string|null, \"email\": string|null, \"phone\": string|null, \
\"location\": string|null, \"linkedin\": string|null, \"website\": string|null },
  \"skills\": [string],
  \"workExperience\": [{ \"company\": string, \"position\": string, \"startDate\": string|null, \
\"endDate\": string|null, \"description\": string|null, \"achievements\": [string], \
\"technologies\": [string] }],
  \"education\": [{ \"institution\": string, \"degree\": string|null, \"fieldOfStudy\": string|null, \
\"startDate\": string|null, \"endDate\": string|null, \"gpa\": string|null }]
}

Rules:
- Use only information present in the text. Do NOT infer or invent details.
- Use null for unknown scalar values and [] for empty lists.
- Keep dates as written in the résumé.

Résumé:
---
{resume_text}
---";

pub fn resume_extraction_prompt(resume_text: &str) -> String {
    RESUME_EXTRACTION_PROMPT.replace("{resume_text}", resume_text)
}
