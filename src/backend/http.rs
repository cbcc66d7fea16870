//! Stores reached over the CouchDB HTTP API.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use n0_future::boxed::BoxFuture;
use reqwest::{
    Method, RequestBuilder, Response, StatusCode,
    header::{COOKIE, SET_COOKIE},
};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Value, json};
use snafu::ResultExt;
use tracing::{debug, trace, warn};
use url::Url;

use super::{AdapterOptions, Backend, StoreAdapter, WriteOutcome};
use crate::{
    auth::{SessionInfo, UserDoc},
    changes::{ChangeEvent, ChangeFeed, ChangesOptions, FeedItem, FeedSender, Sequence, Since},
    document::{DESIGN_PREFIX, Document, LOCAL_PREFIX, Revision},
    error::{DatabaseError, ErrorBody, InvalidBodySnafu, Result, TransportSnafu},
    query::{FindQuery, FindResponse, IndexOutcome, IndexSpec},
};

const AUTH_COOKIE: &str = "AuthSession";
/// How long the server holds a longpoll request open.
const LONGPOLL_TIMEOUT: Duration = Duration::from_secs(25);

/// A database on a CouchDB server.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    inner: Arc<HttpInner>,
}

#[derive(derive_more::Debug)]
struct HttpInner {
    name: String,
    client: reqwest::Client,
    server: Url,
    db: Url,
    #[debug(skip)]
    cookie: Mutex<Option<String>>,
}

#[derive(Debug, Deserialize)]
struct PutResponse {
    rev: Revision,
}

#[derive(Debug, Deserialize)]
struct BulkItem {
    id: String,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChangesResponse {
    results: Vec<ChangeRow>,
    last_seq: Sequence,
}

#[derive(Debug, Deserialize)]
struct ChangeRow {
    id: String,
    seq: Sequence,
    #[serde(default)]
    deleted: bool,
    #[serde(default)]
    changes: Vec<RevEntry>,
    #[serde(default)]
    doc: Option<Document>,
}

#[derive(Debug, Deserialize)]
struct RevEntry {
    rev: Revision,
}

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    name: &'a str,
    password: &'a str,
}

#[derive(Debug, Deserialize)]
struct SessionResponse {
    #[serde(rename = "userCtx")]
    user_ctx: UserCtx,
}

#[derive(Debug, Deserialize)]
struct UserCtx {
    name: Option<String>,
    #[serde(default)]
    roles: Vec<String>,
}

/// Extracts the `AuthSession=...` pair from a `Set-Cookie` header value.
fn auth_cookie(header: &str) -> Option<&str> {
    let pair = header.split(';').next()?.trim();
    let (name, _) = pair.split_once('=')?;
    (name == AUTH_COOKIE).then_some(pair)
}

/// Appends the path segments of a document id to a database url.
///
/// Ids of design and local documents keep their prefix as a separate segment, all other
/// ids are one segment even if they contain a slash.
fn push_doc_segments(url: &mut Url, id: &str) -> Result<()> {
    let mut segments = url
        .path_segments_mut()
        .map_err(|_| url::ParseError::RelativeUrlWithCannotBeABaseBase)
        .context(crate::error::InvalidUrlSnafu)?;
    segments.pop_if_empty();
    for prefix in [DESIGN_PREFIX, LOCAL_PREFIX] {
        if let Some(rest) = id.strip_prefix(prefix) {
            segments.push(prefix.trim_end_matches('/')).push(rest);
            return Ok(());
        }
    }
    segments.push(id);
    Ok(())
}

impl HttpBackend {
    /// Creates a backend for the database `name` on the server at `server`.
    pub fn new(client: reqwest::Client, server: Url, name: &str) -> Result<Self> {
        let mut db = server.clone();
        push_doc_segments(&mut db, name)?;
        Ok(Self {
            inner: Arc::new(HttpInner {
                name: name.to_string(),
                client,
                server,
                db,
                cookie: Mutex::new(None),
            }),
        })
    }

    /// Url of the database.
    pub fn url(&self) -> &Url {
        &self.inner.db
    }

    /// Whether a session cookie is held.
    pub fn has_session_cookie(&self) -> bool {
        self.inner.cookie.lock().expect("poisoned").is_some()
    }

    fn doc_url(&self, id: &str) -> Result<Url> {
        let mut url = self.inner.db.clone();
        push_doc_segments(&mut url, id)?;
        Ok(url)
    }

    fn db_endpoint(&self, endpoint: &str) -> Result<Url> {
        let mut url = self.inner.db.clone();
        url.path_segments_mut()
            .map_err(|_| url::ParseError::RelativeUrlWithCannotBeABaseBase)
            .context(crate::error::InvalidUrlSnafu)?
            .push(endpoint);
        Ok(url)
    }

    fn server_endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.inner.server.clone();
        url.path_segments_mut()
            .map_err(|_| url::ParseError::RelativeUrlWithCannotBeABaseBase)
            .context(crate::error::InvalidUrlSnafu)?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let req = self.inner.client.request(method, url);
        match self.inner.cookie.lock().expect("poisoned").as_deref() {
            Some(cookie) => req.header(COOKIE, cookie),
            None => req,
        }
    }

    /// Sends a request, keeping any session cookie and mapping failure statuses.
    async fn send(&self, req: RequestBuilder) -> Result<Response> {
        let res = req.send().await.context(TransportSnafu)?;
        self.capture_cookie(&res);
        let status = res.status();
        if status.is_success() {
            return Ok(res);
        }
        let body = res.json::<ErrorBody>().await.unwrap_or_default();
        trace!(%status, error = %body.error, "request failed");
        Err(DatabaseError::from_status(status, body))
    }

    async fn send_json<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T> {
        let res = self.send(req).await?;
        let bytes = res.bytes().await.context(TransportSnafu)?;
        serde_json::from_slice(&bytes).context(InvalidBodySnafu)
    }

    fn capture_cookie(&self, res: &Response) {
        for value in res.headers().get_all(SET_COOKIE) {
            let Some(pair) = value.to_str().ok().and_then(auth_cookie) else {
                continue;
            };
            let mut cookie = self.inner.cookie.lock().expect("poisoned");
            // an empty value is the server clearing the session
            *cookie = (!pair.ends_with('=')).then(|| pair.to_string());
        }
    }

    async fn get_doc(&self, id: String) -> Result<Document> {
        let url = self.doc_url(&id)?;
        self.send_json(self.request(Method::GET, url)).await
    }

    async fn put_doc(&self, doc: Document) -> Result<Revision> {
        doc.validate()?;
        let url = self.doc_url(&doc.id)?;
        let res: PutResponse = self
            .send_json(self.request(Method::PUT, url).json(&doc))
            .await?;
        Ok(res.rev)
    }

    async fn bulk(&self, docs: Vec<Document>) -> Result<Vec<WriteOutcome>> {
        let url = self.db_endpoint("_bulk_docs")?;
        let body = json!({ "docs": &docs, "new_edits": false });
        let failures: Vec<BulkItem> = self
            .send_json(self.request(Method::POST, url).json(&body))
            .await?;
        let outcomes = docs
            .into_iter()
            .map(|doc| {
                match failures
                    .iter()
                    .find(|item| item.id == doc.id && item.error.is_some())
                {
                    Some(item) => WriteOutcome::Denied {
                        id: doc.id,
                        reason: item
                            .reason
                            .clone()
                            .or_else(|| item.error.clone())
                            .unwrap_or_default(),
                    },
                    None => WriteOutcome::Written { id: doc.id },
                }
            })
            .collect();
        Ok(outcomes)
    }

    async fn find_docs(&self, query: FindQuery) -> Result<FindResponse> {
        query.selector.validate()?;
        let url = self.db_endpoint("_find")?;
        self.send_json(self.request(Method::POST, url).json(&query))
            .await
    }

    async fn index(&self, index: IndexSpec) -> Result<IndexOutcome> {
        let url = self.db_endpoint("_index")?;
        self.send_json(self.request(Method::POST, url).json(&index))
            .await
    }

    async fn poll_changes(
        &self,
        options: &ChangesOptions,
        since: &str,
        longpoll: bool,
    ) -> Result<ChangesResponse> {
        let mut url = self.db_endpoint("_changes")?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("feed", if longpoll { "longpoll" } else { "normal" })
                .append_pair("since", since);
            if options.include_docs || options.selector.is_some() {
                query.append_pair("include_docs", "true");
            }
            if longpoll {
                query.append_pair("timeout", &LONGPOLL_TIMEOUT.as_millis().to_string());
            }
            if options.selector.is_some() {
                query.append_pair("filter", "_selector");
            }
        }
        let req = match &options.selector {
            Some(selector) => self
                .request(Method::POST, url)
                .json(&json!({ "selector": selector })),
            None => self.request(Method::GET, url),
        };
        self.send_json(req).await
    }

    async fn run_feed(self, options: ChangesOptions, tx: FeedSender) {
        let mut since = options.since.as_param().to_string();
        let mut longpoll = false;
        loop {
            let res = match self.poll_changes(&options, &since, longpoll).await {
                Ok(res) => res,
                Err(err) => {
                    debug!(name = %self.inner.name, "change feed failed: {err:#}");
                    tx.send(Err(err)).await.ok();
                    return;
                }
            };
            for row in res.results {
                let rev = row.changes.into_iter().next().map(|entry| entry.rev);
                let mut event = ChangeEvent {
                    id: row.id,
                    seq: row.seq,
                    deleted: row.deleted,
                    rev,
                    doc: row.doc,
                };
                if !options.accepts(&event) {
                    continue;
                }
                if !options.include_docs {
                    event.doc = None;
                }
                if tx.send(Ok(FeedItem::Change(event))).await.is_err() {
                    return;
                }
            }
            since = res.last_seq.as_str().to_string();
            let caught_up = FeedItem::CaughtUp {
                last_seq: res.last_seq,
            };
            if tx.send(Ok(caught_up)).await.is_err() || !options.live {
                return;
            }
            longpoll = true;
        }
    }

    async fn login_user(&self, username: String, password: String) -> Result<SessionInfo> {
        let url = self.server_endpoint(&["_session"])?;
        let body = LoginRequest {
            name: &username,
            password: &password,
        };
        let info: SessionInfo = self
            .send_json(self.request(Method::POST, url).json(&body))
            .await?;
        debug!(name = %info.name, "logged in");
        Ok(info)
    }

    async fn current_session(&self) -> Result<Option<SessionInfo>> {
        let url = self.server_endpoint(&["_session"])?;
        let res: SessionResponse = self.send_json(self.request(Method::GET, url)).await?;
        Ok(res.user_ctx.name.map(|name| SessionInfo {
            name,
            roles: res.user_ctx.roles,
        }))
    }

    async fn logout_user(&self) -> Result<()> {
        let url = self.server_endpoint(&["_session"])?;
        let res = self.send(self.request(Method::DELETE, url)).await;
        self.inner.cookie.lock().expect("poisoned").take();
        res.map(drop)
    }

    async fn user_doc(&self, name: &str) -> Result<Value> {
        let url = self.server_endpoint(&["_users", &UserDoc::doc_id(name)])?;
        self.send_json(self.request(Method::GET, url)).await
    }

    async fn set_password(&self, name: String, password: String) -> Result<()> {
        let mut doc = self.user_doc(&name).await?;
        if let Some(fields) = doc.as_object_mut() {
            fields.insert("password".to_string(), Value::String(password));
        }
        let url = self.server_endpoint(&["_users", &UserDoc::doc_id(&name)])?;
        self.send(self.request(Method::PUT, url).json(&doc)).await?;
        Ok(())
    }

    async fn local_doc(&self, id: &str) -> Result<Option<Value>> {
        let url = self.doc_url(&format!("{LOCAL_PREFIX}{id}"))?;
        match self.send_json(self.request(Method::GET, url)).await {
            Ok(doc) => Ok(Some(doc)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn store_checkpoint(&self, id: String, seq: Sequence) -> Result<()> {
        let doc_id = format!("{LOCAL_PREFIX}{id}");
        let mut doc = json!({ "_id": doc_id, "last_seq": seq });
        if let Some(rev) = self.local_doc(&id).await?.and_then(|d| d.get("_rev").cloned()) {
            doc["_rev"] = rev;
        }
        let url = self.doc_url(&doc_id)?;
        self.send(self.request(Method::PUT, url).json(&doc)).await?;
        Ok(())
    }

    async fn create_db(&self) -> Result<()> {
        let req = self.request(Method::PUT, self.inner.db.clone());
        match self.send(req).await {
            Ok(_) => Ok(()),
            Err(err) if err.status() == Some(StatusCode::PRECONDITION_FAILED.as_u16()) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

impl Backend for HttpBackend {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn get(&self, id: String) -> BoxFuture<Result<Document>> {
        let this = self.clone();
        Box::pin(async move { this.get_doc(id).await })
    }

    fn put(&self, doc: Document) -> BoxFuture<Result<Revision>> {
        let this = self.clone();
        Box::pin(async move { this.put_doc(doc).await })
    }

    fn bulk_replicate(&self, docs: Vec<Document>) -> BoxFuture<Result<Vec<WriteOutcome>>> {
        let this = self.clone();
        Box::pin(async move { this.bulk(docs).await })
    }

    fn find(&self, query: FindQuery) -> BoxFuture<Result<FindResponse>> {
        let this = self.clone();
        Box::pin(async move { this.find_docs(query).await })
    }

    fn create_index(&self, index: IndexSpec) -> BoxFuture<Result<IndexOutcome>> {
        let this = self.clone();
        Box::pin(async move { this.index(index).await })
    }

    fn changes(&self, options: ChangesOptions) -> BoxFuture<Result<ChangeFeed>> {
        let this = self.clone();
        Box::pin(async move {
            if let Some(selector) = &options.selector {
                selector.validate()?;
            }
            if options.since == Since::Now && !options.live {
                warn!("one-shot change feed since now never yields changes");
            }
            Ok(ChangeFeed::spawn(move |tx| this.run_feed(options, tx)))
        })
    }

    fn login(&self, username: String, password: String) -> BoxFuture<Result<SessionInfo>> {
        let this = self.clone();
        Box::pin(async move { this.login_user(username, password).await })
    }

    fn session(&self) -> BoxFuture<Result<Option<SessionInfo>>> {
        let this = self.clone();
        Box::pin(async move { this.current_session().await })
    }

    fn logout(&self) -> BoxFuture<Result<()>> {
        let this = self.clone();
        Box::pin(async move { this.logout_user().await })
    }

    fn get_user(&self, name: String) -> BoxFuture<Result<UserDoc>> {
        let this = self.clone();
        Box::pin(async move {
            let doc = this.user_doc(&name).await?;
            serde_json::from_value(doc).context(InvalidBodySnafu)
        })
    }

    fn change_password(&self, name: String, password: String) -> BoxFuture<Result<()>> {
        let this = self.clone();
        Box::pin(async move { this.set_password(name, password).await })
    }

    fn read_checkpoint(&self, id: String) -> BoxFuture<Result<Option<Sequence>>> {
        let this = self.clone();
        Box::pin(async move {
            let seq = this
                .local_doc(&id)
                .await?
                .and_then(|doc| doc.get("last_seq").cloned())
                .and_then(|seq| serde_json::from_value(seq).ok());
            Ok(seq)
        })
    }

    fn write_checkpoint(&self, id: String, seq: Sequence) -> BoxFuture<Result<()>> {
        let this = self.clone();
        Box::pin(async move { this.store_checkpoint(id, seq).await })
    }

    fn destroy(&self) -> BoxFuture<Result<()>> {
        let this = self.clone();
        Box::pin(async move {
            let req = this.request(Method::DELETE, this.inner.db.clone());
            this.send(req).await?;
            Ok(())
        })
    }
}

/// Opens [`HttpBackend`]s on one CouchDB server.
#[derive(Debug, Clone)]
pub struct HttpAdapter {
    client: reqwest::Client,
    server: Url,
}

impl HttpAdapter {
    /// Creates an adapter for the server at `server`.
    pub fn new(server: Url) -> Self {
        Self::with_client(reqwest::Client::new(), server)
    }

    /// Creates an adapter sharing an existing HTTP client.
    pub fn with_client(client: reqwest::Client, server: Url) -> Self {
        Self { client, server }
    }

    /// Url of the server.
    pub fn server(&self) -> &Url {
        &self.server
    }
}

impl StoreAdapter for HttpAdapter {
    fn open(&self, name: &str, options: &AdapterOptions) -> BoxFuture<Result<Arc<dyn Backend>>> {
        let backend = HttpBackend::new(self.client.clone(), self.server.clone(), name);
        let skip_setup = options.skip_setup;
        Box::pin(async move {
            let backend = backend?;
            if !skip_setup {
                backend.create_db().await?;
            }
            Ok(Arc::new(backend) as Arc<dyn Backend>)
        })
    }

    fn destroy(&self, name: &str) -> BoxFuture<Result<()>> {
        let backend = HttpBackend::new(self.client.clone(), self.server.clone(), name);
        Box::pin(async move { backend?.destroy().await })
    }
}

#[cfg(test)]
mod tests {
    use n0_snafu::ResultExt;
    use pretty_assertions::assert_eq;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    use super::*;

    #[test]
    fn parses_auth_cookie() {
        assert_eq!(
            auth_cookie("AuthSession=YWxpY2U6; Version=1; Path=/; HttpOnly"),
            Some("AuthSession=YWxpY2U6")
        );
        assert_eq!(auth_cookie("Other=1; Path=/"), None);
        assert_eq!(auth_cookie("AuthSession=; Path=/"), Some("AuthSession="));
    }

    #[test]
    fn builds_document_urls() -> n0_snafu::Result {
        let server: Url = "https://couch.example.org/".parse::<Url>().e()?;
        let backend = HttpBackend::new(reqwest::Client::new(), server, "assoc")?;
        assert_eq!(backend.url().as_str(), "https://couch.example.org/assoc");
        assert_eq!(
            backend.doc_url("member/1")?.as_str(),
            "https://couch.example.org/assoc/member%2F1"
        );
        assert_eq!(
            backend.doc_url("_design/idx-type")?.as_str(),
            "https://couch.example.org/assoc/_design/idx-type"
        );
        assert_eq!(
            backend.doc_url("_local/rep")?.as_str(),
            "https://couch.example.org/assoc/_local/rep"
        );
        assert_eq!(
            backend.server_endpoint(&["_users", "org.couchdb.user:alice"])?.as_str(),
            "https://couch.example.org/_users/org.couchdb.user:alice"
        );
        Ok(())
    }

    /// Serves one canned response per connection.
    async fn serve(responses: Vec<String>) -> Url {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            for response in responses {
                let (mut stream, _) = listener.accept().await.unwrap();
                let mut buf = Vec::new();
                let mut chunk = [0u8; 1024];
                // read headers and body
                loop {
                    let n = stream.read(&mut chunk).await.unwrap();
                    buf.extend_from_slice(&chunk[..n]);
                    let text = String::from_utf8_lossy(&buf);
                    if let Some(end) = text.find("\r\n\r\n") {
                        let len = text[..end]
                            .lines()
                            .find_map(|l| {
                                l.to_ascii_lowercase()
                                    .strip_prefix("content-length:")
                                    .map(|v| v.trim().parse::<usize>().unwrap())
                            })
                            .unwrap_or(0);
                        if buf.len() >= end + 4 + len {
                            break;
                        }
                    }
                    if n == 0 {
                        break;
                    }
                }
                stream.write_all(response.as_bytes()).await.unwrap();
                stream.shutdown().await.ok();
            }
        });
        format!("http://{addr}/").parse().unwrap()
    }

    fn response(status: &str, extra: &str, body: &str) -> String {
        format!(
            "HTTP/1.1 {status}\r\nContent-Type: application/json\r\n{extra}Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        )
    }

    #[tokio::test]
    async fn login_keeps_session_cookie() -> n0_snafu::Result {
        let server = serve(vec![
            response(
                "200 OK",
                "Set-Cookie: AuthSession=abc; Version=1; Path=/; HttpOnly\r\n",
                r#"{"ok":true,"name":"alice","roles":["member"]}"#,
            ),
            response(
                "200 OK",
                "",
                r#"{"ok":true,"userCtx":{"name":"alice","roles":["member"]}}"#,
            ),
        ])
        .await;
        let backend = HttpBackend::new(reqwest::Client::new(), server, "assoc")?;
        let info = backend.login("alice".into(), "secret".into()).await?;
        assert_eq!(info.name, "alice");
        assert!(backend.has_session_cookie());
        let session = backend.session().await?;
        assert_eq!(session.map(|s| s.name), Some("alice".to_string()));
        Ok(())
    }

    #[tokio::test]
    async fn failures_map_to_errors() -> n0_snafu::Result {
        let server = serve(vec![
            response(
                "401 Unauthorized",
                "",
                r#"{"error":"unauthorized","reason":"Name or password is incorrect."}"#,
            ),
            response(
                "409 Conflict",
                "",
                r#"{"error":"conflict","reason":"Document update conflict."}"#,
            ),
        ])
        .await;
        let backend = HttpBackend::new(reqwest::Client::new(), server, "assoc")?;
        let err = backend
            .login("alice".into(), "wrong".into())
            .await
            .unwrap_err();
        assert!(err.is_unauthorized());
        assert_eq!(err.reason(), "Name or password is incorrect.");
        let err = backend
            .put(Document::new("m1").with_type("member"))
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        Ok(())
    }

    #[tokio::test]
    async fn unreachable_server_is_network_error() -> n0_snafu::Result {
        // bind and drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.e()?;
        let addr = listener.local_addr().e()?;
        drop(listener);
        let server: Url = format!("http://{addr}/").parse::<Url>().e()?;
        let backend = HttpBackend::new(reqwest::Client::new(), server, "assoc")?;
        let err = backend.get("m1".into()).await.unwrap_err();
        assert!(err.is_network());
        Ok(())
    }
}
