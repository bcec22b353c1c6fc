//! # Function Templates
//!
//! Starter entrypoints for `create_function`. `{{name}}` is replaced with
//! the function name.

use serde::Serialize;

use super::errors::{FunctionError, FunctionResult};

/// A starter template
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Template {
    pub id: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    #[serde(skip)]
    source: &'static str,
}

const DEFAULT: &str = r#"// {{name}}: edge function
//
// Invoke with:
//   curl -i --request POST 'http://localhost:54321/functions/v1/{{name}}' \
//     --header 'Authorization: Bearer <anon key>' \
//     --header 'Content-Type: application/json' \
//     --data '{"name":"Functions"}'

Deno.serve(async (req: Request) => {
  const { name } = await req.json().catch(() => ({ name: "world" }));
  const data = { message: `Hello ${name}!` };

  return new Response(JSON.stringify(data), {
    headers: { "Content-Type": "application/json" },
  });
});
"#;

const HELLO_WORLD: &str = r#"// {{name}}: plain text hello world

Deno.serve(() => new Response("Hello from {{name}}!"));
"#;

const JSON_API: &str = r#"// {{name}}: JSON API with method routing

const json = (body: unknown, status = 200) =>
  new Response(JSON.stringify(body), {
    status,
    headers: { "Content-Type": "application/json" },
  });

Deno.serve(async (req: Request) => {
  const url = new URL(req.url);

  switch (req.method) {
    case "GET":
      return json({ function: "{{name}}", path: url.pathname });
    case "POST":
      return json({ received: await req.json().catch(() => null) }, 201);
    default:
      return json({ error: "method not allowed" }, 405);
  }
});
"#;

const ECHO_ENV: &str = r#"// {{name}}: echo selected environment variables
//
// GET /{{name}}?keys=API_KEY,OTHER returns their values.

Deno.serve((req: Request) => {
  const keys = (new URL(req.url).searchParams.get("keys") ?? "")
    .split(",")
    .filter((k) => k.length > 0);

  const env: Record<string, string | undefined> = {};
  for (const key of keys) {
    env[key] = Deno.env.get(key);
  }

  return new Response(JSON.stringify(env), {
    headers: { "Content-Type": "application/json" },
  });
});
"#;

/// All templates, `default` first
pub const TEMPLATES: [Template; 4] = [
    Template {
        id: "default",
        name: "Default",
        description: "JSON greeting that reads a name from the request body",
        source: DEFAULT,
    },
    Template {
        id: "hello-world",
        name: "Hello World",
        description: "Plain-text response",
        source: HELLO_WORLD,
    },
    Template {
        id: "json-api",
        name: "JSON API",
        description: "Routes on HTTP method and returns JSON",
        source: JSON_API,
    },
    Template {
        id: "echo-env",
        name: "Echo Env",
        description: "Returns the values of requested environment variables",
        source: ECHO_ENV,
    },
];

/// Look up a template by id
pub fn find(id: &str) -> FunctionResult<&'static Template> {
    TEMPLATES
        .iter()
        .find(|t| t.id == id)
        .ok_or_else(|| FunctionError::UnknownTemplate(id.to_string()))
}

/// Render a template's entrypoint for the given function
pub fn render(id: &str, function_name: &str) -> FunctionResult<String> {
    Ok(find(id)?.source.replace("{{name}}", function_name))
}
