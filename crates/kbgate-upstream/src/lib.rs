mod chat;
mod credentials;

pub use chat::{ChatEndpoints, KbChatClient};
pub use credentials::{
    AUTHORIZATION_COOKIE, Authenticator, CachedCredential, CredentialCache, CredentialStore,
    HttpAuthenticator, LoginSettings, TOKEN_COOKIE, token_from_cookie_header,
};
