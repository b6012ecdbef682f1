//! Minimal HTML for the auth pages
//!
//! Every interpolated value goes through `escape`.

use std::time::Duration;

/// Escape text for HTML element and attribute content.
pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            c => out.push(c),
        }
    }
    out
}

fn layout(title: &str, head_extra: &str, body: &str) -> String {
    format!(
        "<!doctype html>\n<html lang=\"en\">\n<head>\n<meta charset=\"utf-8\">\n\
         <meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\n\
         {head_extra}<title>{}</title>\n</head>\n\
         <body>\n<main>\n{body}\n</main>\n</body>\n</html>\n",
        escape(title)
    )
}

/// Notice shown above the login form.
pub enum LoginNotice<'a> {
    None,
    LinkSent,
    Error(&'a str),
}

/// Magic-link form. `redirected_from` is already sanitized.
pub fn login(action: &str, redirected_from: &str, notice: LoginNotice<'_>) -> String {
    let notice = match notice {
        LoginNotice::None => String::new(),
        LoginNotice::LinkSent => {
            "<p role=\"status\">Check your email for a sign-in link.</p>\n".to_owned()
        }
        LoginNotice::Error(message) => {
            format!("<p role=\"alert\">{}</p>\n", escape(message))
        }
    };
    let body = format!(
        "<h1>Sign in</h1>\n{notice}\
         <form method=\"post\" action=\"{}\">\n\
         <label for=\"email\">Email</label>\n\
         <input id=\"email\" name=\"email\" type=\"email\" autocomplete=\"email\" required>\n\
         <input type=\"hidden\" name=\"redirected_from\" value=\"{}\">\n\
         <button type=\"submit\">Send magic link</button>\n\
         </form>",
        escape(action),
        escape(redirected_from)
    );
    layout("Sign in", "", &body)
}

/// Page that forwards the URL fragment (never sent to servers) back to the
/// callback as a form post. The query string rides along in `action`.
pub fn callback_bridge(action: &str) -> String {
    let body = format!(
        "<p>Signing you in&hellip;</p>\n\
         <form id=\"bridge\" method=\"post\" action=\"{}\">\n\
         <input type=\"hidden\" name=\"fragment\" value=\"\">\n\
         <noscript><button type=\"submit\">Continue</button></noscript>\n\
         </form>\n\
         <script>\n\
         const form = document.getElementById(\"bridge\");\n\
         form.elements.fragment.value = window.location.hash.replace(/^#/, \"\");\n\
         form.submit();\n\
         </script>",
        escape(action)
    );
    layout("Signing in", "", &body)
}

/// Error view that returns to `login_url` after `delay`.
pub fn callback_error(message: &str, login_url: &str, delay: Duration) -> String {
    let head = format!(
        "<meta http-equiv=\"refresh\" content=\"{};url={}\">\n",
        delay.as_secs(),
        escape(login_url)
    );
    let body = format!(
        "<h1>Sign-in failed</h1>\n<p role=\"alert\">{}</p>\n\
         <p>Returning to <a href=\"{}\">sign in</a>&hellip;</p>",
        escape(message),
        escape(login_url)
    );
    layout("Sign-in failed", &head, &body)
}
