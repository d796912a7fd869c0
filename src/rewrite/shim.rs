//! Client-side runtime shim injected into rewritten HTML

use super::RewriteContext;

/// Constructor factory shared by the shim and rewritten `new WebSocket(...)`
/// calls. Takes the native constructor, the WebSocket endpoint and the base
/// URL, and returns a drop-in constructor that dials through the proxy.
const WEBSOCKET_FACTORY: &str = "(function(N,E,B){function P(u,p){var r=String(u);\
try{r=new URL(r,B).href.replace(/^http/i,'ws')}catch(e){}\
if(r.indexOf(E)!==0)r=E+'?url='+encodeURIComponent(r);\
return p===undefined?new N(r):new N(r,p)}\
P.prototype=N.prototype;P.CONNECTING=0;P.OPEN=1;P.CLOSING=2;P.CLOSED=3;return P})";

const CLIENT_TEMPLATE: &str = r#"<script data-bare-shim>
(function () {
  if (self.__bare) return;
  var PROXY = __PROXY__, WS = __WS__, BASE = __BASE__;
  var SKIP = /^(?:#|javascript:|data:|blob:|mailto:|tel:|about:)/i;
  var TARGET_ORIGIN = new URL(BASE).origin;

  function absolute(u) {
    var abs;
    try { abs = new URL(u, BASE); } catch (e) { return null; }
    if (abs.origin === location.origin && abs.href.indexOf(PROXY) !== 0) {
      abs = new URL(abs.pathname + abs.search + abs.hash, TARGET_ORIGIN);
    }
    return abs.href;
  }

  function rewrite(u) {
    if (u == null) return u;
    var s = String(u).trim();
    if (!s || SKIP.test(s) || s.indexOf(PROXY) === 0) return u;
    var abs = absolute(s);
    if (!abs || !/^https?:/i.test(abs)) return u;
    return PROXY + '?url=' + encodeURIComponent(abs);
  }

  self.__bare = { proxy: PROXY, ws: WS, base: BASE, rewrite: rewrite };

  var nativeFetch = self.fetch;
  if (nativeFetch) {
    self.fetch = function (input, init) {
      if (typeof Request !== 'undefined' && input instanceof Request) {
        input = new Request(rewrite(input.url), input);
      } else {
        input = rewrite(input);
      }
      return nativeFetch.call(self, input, init);
    };
  }

  if (self.XMLHttpRequest) {
    var nativeOpen = XMLHttpRequest.prototype.open;
    XMLHttpRequest.prototype.open = function (method, url) {
      var args = Array.prototype.slice.call(arguments);
      args[1] = rewrite(url);
      return nativeOpen.apply(this, args);
    };
  }

  if (self.WebSocket) {
    self.__bareWebSocket = __FACTORY__(self.WebSocket, WS, BASE);
    self.WebSocket = self.__bareWebSocket;
  }
})();
</script>"#;

/// Encode a string as a JavaScript literal that is safe inside `<script>`
pub fn js_string(value: &str) -> String {
    serde_json::to_string(value)
        .unwrap_or_else(|_| "\"\"".to_string())
        .replace("</", "<\\/")
}

/// The `<script>` block patching fetch, XMLHttpRequest and WebSocket
pub fn client_script(ctx: &RewriteContext) -> String {
    CLIENT_TEMPLATE
        .replace("__PROXY__", &js_string(ctx.proxy_endpoint()))
        .replace("__WS__", &js_string(ctx.ws_endpoint()))
        .replace("__BASE__", &js_string(ctx.base_url().as_str()))
        .replace("__FACTORY__", WEBSOCKET_FACTORY)
}

/// Constructor expression used in place of a bare `WebSocket` in `new` calls
///
/// Prefers the page shim's constructor and falls back to an inline one bound
/// to this document's base URL.
pub fn websocket_constructor(ctx: &RewriteContext) -> String {
    format!(
        "(self.__bareWebSocket||{}(WebSocket,{},{}))",
        WEBSOCKET_FACTORY,
        js_string(ctx.ws_endpoint()),
        js_string(ctx.base_url().as_str())
    )
}
