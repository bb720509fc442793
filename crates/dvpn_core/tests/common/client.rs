use axum::{Router, serve};
use reqwest::{
    Client, StatusCode,
    header::{HeaderMap, HeaderValue, USER_AGENT},
};
use serde::{Serialize, de::DeserializeOwned};
use tokio::{net::TcpListener, task::JoinHandle};

pub struct TestClient {
    client: Client,
    port: u16,
    // Has to live during whole test
    api_task_handle: JoinHandle<()>,
}

impl TestClient {
    #[must_use]
    pub fn new(app: Router, listener: TcpListener) -> Self {
        let port = listener.local_addr().unwrap().port();

        let api_task_handle = tokio::spawn(async move {
            serve(listener, app).await.expect("server error");
        });

        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static("test/0.0"));
        let client = Client::builder().default_headers(headers).build().unwrap();

        TestClient {
            client,
            port,
            api_task_handle,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://localhost:{}{path}", self.port)
    }

    pub fn get(&self, path: &str) -> RequestBuilder {
        RequestBuilder {
            builder: self.client.get(self.url(path)),
        }
    }

    pub fn post(&self, path: &str) -> RequestBuilder {
        RequestBuilder {
            builder: self.client.post(self.url(path)),
        }
    }
}

impl Drop for TestClient {
    fn drop(&mut self) {
        // explicitly stop spawned API server task
        self.api_task_handle.abort();
    }
}

pub struct RequestBuilder {
    builder: reqwest::RequestBuilder,
}

impl RequestBuilder {
    pub async fn send(self) -> TestResponse {
        TestResponse {
            response: self.builder.send().await.unwrap(),
        }
    }

    #[must_use]
    pub fn json<T: Serialize + ?Sized>(mut self, json: &T) -> Self {
        self.builder = self.builder.json(json);
        self
    }

    #[must_use]
    pub fn body(mut self, body: &'static str) -> Self {
        self.builder = self
            .builder
            .header("content-type", "application/json")
            .body(body);
        self
    }
}

pub struct TestResponse {
    response: reqwest::Response,
}

impl TestResponse {
    pub async fn json<T: DeserializeOwned>(self) -> T {
        self.response.json().await.unwrap()
    }

    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.response.status()
    }

    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.response
            .headers()
            .get(name)
            .and_then(|value| value.to_str().ok())
    }
}
