//! Tenant configuration form served by GET /authorize.

use crate::oauth::PendingAuthorization;

pub(super) struct FormContext<'a> {
    pub client_name: &'a str,
    pub pending: &'a PendingAuthorization,
    pub csrf_token: &'a str,
}

/// Escapes text for HTML element content and double-quoted attributes.
pub(super) fn escape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            _ => out.push(c),
        }
    }
    out
}

fn hidden(name: &str, value: &str) -> String {
    format!(
        r#"<input type="hidden" name="{}" value="{}">"#,
        name,
        escape(value)
    )
}

pub(super) fn render(ctx: &FormContext<'_>) -> String {
    let pending = ctx.pending;
    let hidden_fields = [
        hidden("client_id", &pending.client_id),
        hidden("redirect_uri", &pending.redirect_uri),
        hidden("state", pending.state.as_deref().unwrap_or("")),
        hidden("code_challenge", &pending.code_challenge),
        hidden("code_challenge_method", &pending.code_challenge_method),
        hidden("csrf_token", ctx.csrf_token),
    ]
    .join("\n      ");

    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <meta name="viewport" content="width=device-width, initial-scale=1">
  <title>Connect task workspace</title>
  <style>
    body {{ font-family: system-ui, sans-serif; max-width: 32rem; margin: 3rem auto; padding: 0 1rem; }}
    label {{ display: block; margin-top: 1rem; font-weight: 600; }}
    input, select {{ width: 100%; padding: 0.5rem; margin-top: 0.25rem; box-sizing: border-box; }}
    button {{ margin-top: 1.5rem; padding: 0.6rem 1.2rem; }}
    .hint {{ color: #666; font-size: 0.85rem; }}
    #error {{ color: #b00020; margin-top: 1rem; }}
  </style>
</head>
<body>
  <h1>Connect {client_name}</h1>
  <p>{client_name} is requesting access to your task workspace.</p>
  <form id="authorize">
      {hidden_fields}
    <label for="name">Connection name</label>
    <input id="name" name="name" autocomplete="off">
    <label for="api_key">API key</label>
    <input id="api_key" name="api_key" type="password" required autocomplete="off">
    <label for="workspace_id">Workspace id</label>
    <input id="workspace_id" name="workspace_id" autocomplete="off">
    <div class="hint">Leave empty to use the first workspace the key can access.</div>
    <label for="write_mode">Write access</label>
    <select id="write_mode" name="write_mode">
      <option value="write">Full write access</option>
      <option value="read">Read only</option>
      <option value="selective">Only selected spaces and lists</option>
    </select>
    <label for="allowed_spaces">Allowed space ids</label>
    <input id="allowed_spaces" name="allowed_spaces" placeholder="comma separated">
    <label for="allowed_lists">Allowed list ids</label>
    <input id="allowed_lists" name="allowed_lists" placeholder="comma separated">
    <button type="submit">Authorize</button>
    <div id="error"></div>
  </form>
  <script>
    const split = (v) => v.split(",").map((s) => s.trim()).filter((s) => s.length > 0);
    document.getElementById("authorize").addEventListener("submit", async (event) => {{
      event.preventDefault();
      const f = event.target.elements;
      const config = {{
        api_key: f.api_key.value,
        write_mode: f.write_mode.value,
        allowed_spaces: split(f.allowed_spaces.value),
        allowed_lists: split(f.allowed_lists.value),
      }};
      if (f.workspace_id.value.trim()) config.workspace_id = f.workspace_id.value.trim();
      const body = {{
        client_id: f.client_id.value,
        name: f.name.value || null,
        config,
        redirect_uri: f.redirect_uri.value,
        state: f.state.value || null,
        code_challenge: f.code_challenge.value,
        code_challenge_method: f.code_challenge_method.value,
        csrf_token: f.csrf_token.value,
      }};
      const res = await fetch("/authorize", {{
        method: "POST",
        credentials: "same-origin",
        headers: {{ "Content-Type": "application/json" }},
        body: JSON.stringify(body),
      }});
      const data = await res.json();
      if (res.ok && data.redirectUrl) {{
        window.location.href = data.redirectUrl;
      }} else {{
        document.getElementById("error").textContent = data.error_description || "Authorization failed";
      }}
    }});
  </script>
</body>
</html>
"#,
        client_name = escape(ctx.client_name),
        hidden_fields = hidden_fields,
    )
}
