//! Where the negotiator gets the username and password from.
//!
//! The source is queried once per exchange, before the first frame is sent.

/// Source of login credentials. `None` means the value is not available.
pub trait CredentialSource: Send + Sync {
    fn username(&self) -> Option<String>;
    fn password(&self) -> Option<String>;
}

/// Fixed username and password.
#[derive(Clone, Default)]
pub struct Credentials {
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
        }
    }
}

// Never print the password.
impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl CredentialSource for Credentials {
    fn username(&self) -> Option<String> {
        self.username.clone()
    }

    fn password(&self) -> Option<String> {
        self.password.clone()
    }
}

/// Credentials provided by a pair of callbacks, e.g. reading from a keychain
/// or prompting the user.
pub struct FnCredentials<U, P> {
    username: U,
    password: P,
}

impl<U, P> FnCredentials<U, P>
where
    U: Fn() -> Option<String> + Send + Sync,
    P: Fn() -> Option<String> + Send + Sync,
{
    pub fn new(username: U, password: P) -> Self {
        Self { username, password }
    }
}

impl<U, P> CredentialSource for FnCredentials<U, P>
where
    U: Fn() -> Option<String> + Send + Sync,
    P: Fn() -> Option<String> + Send + Sync,
{
    fn username(&self) -> Option<String> {
        (self.username)()
    }

    fn password(&self) -> Option<String> {
        (self.password)()
    }
}

/// Both values, or `None` if either is absent. Empty strings are passed
/// through; the server decides whether they are acceptable.
pub(crate) fn fetch(source: &dyn CredentialSource) -> Option<(String, String)> {
    Some((source.username()?, source.password()?))
}
